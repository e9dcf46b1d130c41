//! Superblock and group-descriptor table.
//!
//! Block 0 of the image holds the 128-byte superblock followed by the
//! packed array of 32-byte group descriptors. The superblock carries the
//! fixed geometry, the global allocation counters and the 64-byte
//! authenticator that gates encrypted mounts; each descriptor locates one
//! block group's bitmaps and inode table by byte offset and tracks its
//! free counts.

use bytemuck::{from_bytes, from_bytes_mut, Pod, Zeroable};

use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::block::{Block, BLOCK_SIZE};
use crate::fs::inode::INODE_SIZE;

/// log2 of the block size in KiB.
pub const LOG_BLOCK_SIZE: u32 = 2;

/// 512-byte sectors occupied by one block.
pub const SECTORS_PER_BLOCK: u32 = 2 << LOG_BLOCK_SIZE;

/// Inodes held by one inode-table block.
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;

/// Data blocks covered by one group: one bit per block-bitmap bit.
pub const BLOCKS_PER_GROUP: u32 = (BLOCK_SIZE * 8) as u32;

/// Inodes covered by one group: one bit per inode-bitmap bit.
pub const INODES_PER_GROUP: u32 = (BLOCK_SIZE * 8) as u32;

/// Blocks of inode table needed for a full group.
pub const NUM_INODE_TABLE_BLOCKS: u32 = INODES_PER_GROUP / INODES_PER_BLOCK;

/// Total stripe width of one group in blocks: inode bitmap, block bitmap,
/// inode table, data blocks.
pub const TOTAL_BLOCKS_PER_GROUP: u32 = BLOCKS_PER_GROUP + NUM_INODE_TABLE_BLOCKS + 2;

/// Byte span of one group on the device.
pub const MAX_BLOCK_GROUP_SIZE: u64 = TOTAL_BLOCKS_PER_GROUP as u64 * BLOCK_SIZE as u64;

/// Inode number of the filesystem root.
pub const ROOT_INODE: u32 = 0;

/// `s_state` of a never-formatted image.
pub const STATE_UNINIT: u16 = 0;
/// `s_state` of a formatted image.
pub const STATE_NORMAL: u16 = 1;

/// Byte offset of the authenticator inside block 0.
pub const AUTH_OFFSET: usize = 40;
/// Length of the authenticator field.
pub const AUTH_LEN: usize = 64;

/// Plaintext the authenticator must decrypt to on a formatted image.
pub const AUTH_PLAINTEXT: &[u8] = b"See you ultraman, someday somewhere!";

const SUPERBLOCK_SIZE: usize = 128;
const GROUP_DESC_SIZE: usize = 32;

/// The superblock as laid out on disk (little-endian).
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct RawSuperblock {
    /// Total inode capacity across all materialized groups.
    pub s_inodes_count: u32,
    /// Total data-block capacity across all materialized groups.
    pub s_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    /// log2 of the block size in KiB.
    pub s_log_block_size: u32,
    /// Stripe width of one group in blocks.
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    /// First inode: the root directory.
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    /// [`STATE_UNINIT`] or [`STATE_NORMAL`].
    pub s_state: u16,
    /// Number of materialized block groups.
    pub s_group: u32,
    /// Encrypted-at-rest authenticator.
    pub s_auth_string: [u8; 64],
    pub _reserved: [u8; 24],
}

/// One group descriptor: byte offsets of the group's metadata regions plus
/// its free counters.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct GroupDesc {
    /// Byte offset of the group's block bitmap.
    pub bg_block_bitmap: u32,
    /// Byte offset of the group's inode bitmap.
    pub bg_inode_bitmap: u32,
    /// Byte offset of the group's inode-table region.
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub _pad: u16,
    pub _reserved: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<RawSuperblock>() == SUPERBLOCK_SIZE);
const _: () = assert!(core::mem::size_of::<GroupDesc>() == GROUP_DESC_SIZE);

/// Block 0 held in memory: the superblock plus the descriptor array.
pub struct SuperBlock {
    block: Block,
}

impl SuperBlock {
    /// Loads block 0 and brings the image up.
    ///
    /// An `UNINIT` image is formatted in place: geometry written, the
    /// authenticator set, and group 0 laid out. A `NORMAL` image must
    /// decrypt to the well-known authenticator or the mount is refused
    /// with [`FsError::AuthError`].
    pub fn load(dev: &Device, cipher: &Cipher) -> FsResult<Self> {
        let block = Block::load(dev, cipher, 0)?;
        let mut sb = Self { block };

        match sb.raw().s_state {
            STATE_UNINIT => {
                info!("super", "uninitialized image, formatting");
                sb.format();
                sb.flush(dev, cipher)?;
            }
            STATE_NORMAL => {
                let auth = &sb.raw().s_auth_string;
                if &auth[..AUTH_PLAINTEXT.len()] != AUTH_PLAINTEXT
                    || auth[AUTH_PLAINTEXT.len()..].iter().any(|&b| b != 0)
                {
                    error!("super", "authenticator mismatch, refusing mount");
                    return Err(FsError::AuthError);
                }
            }
            state => {
                error!("super", "unknown filesystem state {state}");
                return Err(FsError::IoError);
            }
        }

        Ok(sb)
    }

    fn format(&mut self) {
        let raw = self.raw_mut();
        raw.s_log_block_size = LOG_BLOCK_SIZE;
        raw.s_blocks_per_group = TOTAL_BLOCKS_PER_GROUP;
        raw.s_inodes_per_group = INODES_PER_GROUP;
        raw.s_blocks_count = BLOCKS_PER_GROUP;
        raw.s_inodes_count = INODES_PER_GROUP;
        raw.s_free_blocks_count = BLOCKS_PER_GROUP;
        raw.s_free_inodes_count = INODES_PER_GROUP;
        raw.s_first_ino = ROOT_INODE;
        raw.s_inode_size = INODE_SIZE as u16;
        raw.s_state = STATE_NORMAL;
        raw.s_group = 0;
        raw.s_auth_string[..AUTH_PLAINTEXT.len()].copy_from_slice(AUTH_PLAINTEXT);

        // Group 0: inode bitmap, block bitmap, inode table, data blocks.
        let desc = GroupDesc {
            bg_inode_bitmap: BLOCK_SIZE as u32,
            bg_block_bitmap: 2 * BLOCK_SIZE as u32,
            bg_inode_table: 3 * BLOCK_SIZE as u32,
            bg_free_blocks_count: BLOCKS_PER_GROUP as u16,
            bg_free_inodes_count: INODES_PER_GROUP as u16,
            bg_used_dirs_count: 0,
            _pad: 0,
            _reserved: [0; 12],
        };
        self.write_desc(0, &desc);
        self.raw_mut().s_group = 1;
    }

    pub fn raw(&self) -> &RawSuperblock {
        from_bytes(&self.block.bytes()[..SUPERBLOCK_SIZE])
    }

    /// Mutable view of the superblock fields; marks block 0 dirty.
    pub fn raw_mut(&mut self) -> &mut RawSuperblock {
        self.block.mark_dirty();
        from_bytes_mut(&mut self.block.bytes_mut()[..SUPERBLOCK_SIZE])
    }

    pub fn num_groups(&self) -> u32 {
        self.raw().s_group
    }

    /// Copy of the `index`-th group descriptor.
    pub fn group_desc(&self, index: u32) -> Option<GroupDesc> {
        if index >= self.num_groups() {
            return None;
        }
        let at = SUPERBLOCK_SIZE + index as usize * GROUP_DESC_SIZE;
        if at + GROUP_DESC_SIZE > BLOCK_SIZE {
            return None;
        }
        Some(*from_bytes(&self.block.bytes()[at..at + GROUP_DESC_SIZE]))
    }

    /// Writes `desc` into the descriptor array slot `index`.
    pub fn write_desc(&mut self, index: u32, desc: &GroupDesc) {
        let at = SUPERBLOCK_SIZE + index as usize * GROUP_DESC_SIZE;
        self.block.mark_dirty();
        self.block.bytes_mut()[at..at + GROUP_DESC_SIZE].copy_from_slice(bytemuck::bytes_of(desc));
    }

    /// Appends a descriptor for a new group, failing when the array would
    /// no longer fit in block 0 alongside the superblock.
    pub fn push_desc(&mut self, desc: &GroupDesc) -> FsResult<u32> {
        let index = self.num_groups();
        let end = SUPERBLOCK_SIZE + (index as usize + 1) * GROUP_DESC_SIZE;
        if end > BLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        self.write_desc(index, desc);
        self.raw_mut().s_group = index + 1;
        Ok(index)
    }

    /// Group owning the global inode index `inode`.
    pub fn inode_group(inode: u32) -> u32 {
        inode / INODES_PER_GROUP
    }

    /// Index of `inode` within its group.
    pub fn inode_local(inode: u32) -> u32 {
        inode % INODES_PER_GROUP
    }

    /// Group owning the global data-block index `block`.
    pub fn block_group(block: u32) -> u32 {
        block / BLOCKS_PER_GROUP
    }

    /// Index of `block` within its group.
    pub fn block_local(block: u32) -> u32 {
        block % BLOCKS_PER_GROUP
    }

    pub fn flush(&mut self, dev: &Device, cipher: &Cipher) -> CanFail<FsError> {
        if self.block.is_dirty() {
            self.block.flush(dev, cipher)?;
        }
        Ok(())
    }
}
