//! The fundamental unit of disk I/O.
//!
//! A [`Block`] is 4096 bytes of payload plus the byte offset it lives at on
//! the device and a dirty flag. Typed views (superblock, bitmap, inode
//! table, directory records) reinterpret a block's bytes for the duration
//! of a borrow; the block itself stays untyped.

use std::sync::Arc;

use spin::RwLock;

use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::sb::{AUTH_LEN, AUTH_OFFSET};

/// Size of one filesystem block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Backing store of a block, aligned for direct I/O.
#[repr(C, align(4096))]
pub struct AlignedBuf(pub [u8; BLOCK_SIZE]);

impl AlignedBuf {
    fn zeroed() -> Box<Self> {
        Box::new(Self([0; BLOCK_SIZE]))
    }
}

/// One block of the filesystem, held in memory.
///
/// The payload is decrypted; encryption happens on the way out in
/// [`Block::flush`]. Block 0 is special: only its 64-byte authenticator
/// window is transformed so the layout fields stay readable before the
/// mount is authenticated.
pub struct Block {
    offset: u64,
    dirty: bool,
    data: Box<AlignedBuf>,
}

/// A block shared between the cache and its current users.
pub type SharedBlock = Arc<RwLock<Block>>;

impl Block {
    /// Reads the block at byte offset `offset` from the device and
    /// decrypts it.
    pub fn load(dev: &Device, cipher: &Cipher, offset: u64) -> FsResult<Self> {
        let mut data = AlignedBuf::zeroed();
        dev.read_at(offset, &mut data.0)?;

        if offset == 0 {
            cipher.decrypt(&mut data.0[AUTH_OFFSET..AUTH_OFFSET + AUTH_LEN]);
        } else {
            cipher.decrypt(&mut data.0);
        }

        Ok(Self {
            offset,
            dirty: false,
            data,
        })
    }

    /// A fresh all-zero block destined for `offset`. Starts dirty since it
    /// only exists in memory.
    pub fn zeroed(offset: u64) -> Self {
        Self {
            offset,
            dirty: true,
            data: AlignedBuf::zeroed(),
        }
    }

    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data.0
    }

    /// Mutable access to the payload. Callers mutating through this must
    /// also call [`Block::mark_dirty`].
    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data.0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Encrypts the payload into a scratch buffer and writes it back to the
    /// device, clearing the dirty flag.
    pub fn flush(&mut self, dev: &Device, cipher: &Cipher) -> CanFail<FsError> {
        let mut scratch = AlignedBuf::zeroed();
        scratch.0.copy_from_slice(&self.data.0);

        if self.offset == 0 {
            cipher.encrypt(&mut scratch.0[AUTH_OFFSET..AUTH_OFFSET + AUTH_LEN]);
        } else {
            cipher.encrypt(&mut scratch.0);
        }

        dev.write_at(self.offset, &scratch.0)?;
        self.dirty = false;
        Ok(())
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("offset", &self.offset)
            .field("dirty", &self.dirty)
            .finish()
    }
}
