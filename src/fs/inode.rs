//! On-disk inode layout.
//!
//! Inodes are fixed 128-byte records stored in per-group inode tables.
//! The block map (`i_block`) holds 12 direct block indices followed by the
//! single-, double- and triple-indirect roots; an indirect block is 1024
//! little-endian `u32` block indices.

use bytemuck::{Pod, Zeroable};

use crate::fs::block::BLOCK_SIZE;

/// Size of one on-disk inode in bytes.
pub const INODE_SIZE: usize = 128;

/// Number of direct slots in the block map.
pub const NUM_DIRECT_BLOCKS: usize = 12;

/// Entries held by one indirect block.
pub const NUM_INDIRECT_BLOCKS: u32 = (BLOCK_SIZE / 4) as u32;

/// Slot of the single-indirect root in `i_block`.
pub const IND_SLOT: usize = 12;
/// Slot of the double-indirect root in `i_block`.
pub const DIND_SLOT: usize = 13;
/// Slot of the triple-indirect root in `i_block`.
pub const TIND_SLOT: usize = 14;

/// File type mask of `i_mode`.
pub const S_IFMT: u16 = 0xf000;
/// Directory type bits.
pub const S_IFDIR: u16 = 0x4000;
/// Regular-file type bits.
pub const S_IFREG: u16 = 0x8000;
/// Symbolic-link type bits.
pub const S_IFLNK: u16 = 0xa000;

/// Current time as 32-bit Unix seconds, the granularity inodes store.
pub fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Structure of an inode on the disk.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    /// File mode: type nibble plus Unix permission bits.
    pub i_mode: u16,
    /// Owner uid.
    pub i_uid: u16,
    /// File size in bytes; symlink target length for symlinks.
    pub i_size: u32,
    /// Last access time.
    pub i_atime: u32,
    /// Creation time.
    pub i_ctime: u32,
    /// Last modification time.
    pub i_mtime: u32,
    /// Deletion time.
    pub i_dtime: u32,
    /// Group id.
    pub i_gid: u16,
    /// Hard-link count.
    pub i_links_count: u16,
    /// 512-byte sectors occupied by the file's data blocks.
    pub i_blocks: u32,
    /// File flags. Unused by the engine, kept for format compatibility.
    pub i_flags: u32,
    pub osd1: [u8; 4],
    /// Block map: 12 direct slots, then the indirect roots.
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub osd2: [u8; 12],
}

impl Inode {
    /// A freshly created inode: empty, one link, all timestamps at `time`.
    pub fn create(mode: u16, time: u32) -> Self {
        let mut inode = Self::zeroed();
        inode.i_mode = mode;
        inode.i_links_count = 1;
        inode.i_atime = time;
        inode.i_ctime = time;
        inode.i_mtime = time;
        inode
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.i_mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.i_mode & S_IFMT == S_IFLNK
    }

    /// The directory-record file type byte derived from the mode.
    pub fn file_type(&self) -> u8 {
        (self.i_mode >> 12) as u8
    }

    /// Number of data blocks currently wired into the block map.
    pub fn num_blocks(&self) -> u32 {
        self.i_blocks / crate::fs::sb::SECTORS_PER_BLOCK
    }
}

const _: () = assert!(core::mem::size_of::<Inode>() == INODE_SIZE);
