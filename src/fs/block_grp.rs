//! Block groups.
//!
//! A group is a contiguous stripe of the device: one inode bitmap block,
//! one block bitmap block, the inode-table blocks, then the data blocks.
//! Each group allocates and frees inodes and data blocks within itself;
//! routing across groups is the filesystem core's job.

use bytemuck::Zeroable;
use hashbrown::HashMap;

use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::bitmap::BitmapView;
use crate::fs::block::{Block, BLOCK_SIZE};
use crate::fs::inode::{Inode, INODE_SIZE};
use crate::fs::sb::{GroupDesc, BLOCKS_PER_GROUP, INODES_PER_BLOCK, INODES_PER_GROUP, NUM_INODE_TABLE_BLOCKS};

/// One block group held in memory.
///
/// The descriptor is an owned copy; the filesystem core writes it back
/// into block 0 whenever the group is flushed. Inode-table blocks are
/// loaded lazily, keyed by their index within the table.
pub struct BlockGroup {
    index: u32,
    desc: GroupDesc,
    desc_dirty: bool,
    inode_bitmap: Block,
    block_bitmap: Block,
    inode_table: HashMap<u32, Block>,
}

impl BlockGroup {
    /// Loads an existing group from its descriptor.
    pub fn load(dev: &Device, cipher: &Cipher, index: u32, desc: GroupDesc) -> FsResult<Self> {
        let inode_bitmap = Block::load(dev, cipher, desc.bg_inode_bitmap as u64)?;
        let block_bitmap = Block::load(dev, cipher, desc.bg_block_bitmap as u64)?;
        Ok(Self {
            index,
            desc,
            desc_dirty: false,
            inode_bitmap,
            block_bitmap,
            inode_table: HashMap::new(),
        })
    }

    /// Materializes a brand new group: empty bitmaps, nothing loaded.
    pub fn init(index: u32, desc: GroupDesc) -> Self {
        Self {
            index,
            desc,
            desc_dirty: true,
            inode_bitmap: Block::zeroed(desc.bg_inode_bitmap as u64),
            block_bitmap: Block::zeroed(desc.bg_block_bitmap as u64),
            inode_table: HashMap::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn desc(&self) -> &GroupDesc {
        &self.desc
    }

    /// Whether the descriptor copy diverged from block 0.
    pub fn desc_dirty(&self) -> bool {
        self.desc_dirty
    }

    pub fn clear_desc_dirty(&mut self) {
        self.desc_dirty = false;
    }

    /// Byte offset of inode-table block `k`.
    fn inode_block_offset(&self, k: u32) -> u64 {
        self.desc.bg_block_bitmap as u64 + (k as u64 + 1) * BLOCK_SIZE as u64
    }

    /// Byte offset of data block `k`. Data blocks start right after the
    /// inode table.
    fn data_block_offset(&self, k: u32) -> u64 {
        self.desc.bg_block_bitmap as u64
            + (NUM_INODE_TABLE_BLOCKS as u64 + 1 + k as u64) * BLOCK_SIZE as u64
    }

    fn table_block(&mut self, dev: &Device, cipher: &Cipher, k: u32) -> FsResult<&mut Block> {
        if !self.inode_table.contains_key(&k) {
            let block = Block::load(dev, cipher, self.inode_block_offset(k))?;
            self.inode_table.insert(k, block);
        }
        Ok(self.inode_table.get_mut(&k).ok_or(FsError::NullPtr)?)
    }

    /// Whether the inode bitmap claims `local` allocated.
    pub fn inode_allocated(&mut self, local: u32) -> bool {
        BitmapView::new(&mut self.inode_bitmap).test(local)
    }

    /// Whether the block bitmap claims `local` allocated.
    pub fn block_allocated(&mut self, local: u32) -> bool {
        BitmapView::new(&mut self.block_bitmap).test(local)
    }

    /// Copies out the inode at `local`, `None` when its bit is clear.
    pub fn get_inode(
        &mut self,
        dev: &Device,
        cipher: &Cipher,
        local: u32,
    ) -> FsResult<Option<Inode>> {
        if !self.inode_allocated(local) {
            return Ok(None);
        }
        let block = self.table_block(dev, cipher, local / INODES_PER_BLOCK)?;
        let at = (local % INODES_PER_BLOCK) as usize * INODE_SIZE;
        Ok(Some(*bytemuck::from_bytes(
            &block.bytes()[at..at + INODE_SIZE],
        )))
    }

    /// Writes `inode` into the table slot `local`.
    pub fn put_inode(
        &mut self,
        dev: &Device,
        cipher: &Cipher,
        local: u32,
        inode: &Inode,
    ) -> CanFail<FsError> {
        let block = self.table_block(dev, cipher, local / INODES_PER_BLOCK)?;
        let at = (local % INODES_PER_BLOCK) as usize * INODE_SIZE;
        block.bytes_mut()[at..at + INODE_SIZE].copy_from_slice(bytemuck::bytes_of(inode));
        block.mark_dirty();
        Ok(())
    }

    /// Loads the data block at `local`, `None` when its bit is clear.
    pub fn get_block(
        &mut self,
        dev: &Device,
        cipher: &Cipher,
        local: u32,
    ) -> FsResult<Option<Block>> {
        if !self.block_allocated(local) {
            return Ok(None);
        }
        Ok(Some(Block::load(dev, cipher, self.data_block_offset(local))?))
    }

    /// Allocates the first free inode of the group, zeroing its table
    /// slot. Returns the local index, or `None` when the group is full.
    pub fn alloc_inode(
        &mut self,
        dev: &Device,
        cipher: &Cipher,
        is_dir: bool,
    ) -> FsResult<Option<u32>> {
        let mut bitmap = BitmapView::new(&mut self.inode_bitmap);
        let Some(local) = bitmap.find_first_clear(INODES_PER_GROUP) else {
            return Ok(None);
        };
        bitmap.set(local);
        self.inode_bitmap.mark_dirty();

        self.desc.bg_free_inodes_count -= 1;
        if is_dir {
            self.desc.bg_used_dirs_count += 1;
        }
        self.desc_dirty = true;

        self.put_inode(dev, cipher, local, &Inode::zeroed())?;
        Ok(Some(local))
    }

    /// Allocates the first free data block of the group. The block comes
    /// back zeroed and dirty.
    pub fn alloc_block(&mut self) -> FsResult<Option<(u32, Block)>> {
        let mut bitmap = BitmapView::new(&mut self.block_bitmap);
        let Some(local) = bitmap.find_first_clear(BLOCKS_PER_GROUP) else {
            return Ok(None);
        };
        bitmap.set(local);
        self.block_bitmap.mark_dirty();

        self.desc.bg_free_blocks_count -= 1;
        self.desc_dirty = true;

        Ok(Some((local, Block::zeroed(self.data_block_offset(local)))))
    }

    /// Releases inode `local` back to the group.
    pub fn free_inode(&mut self, local: u32, was_dir: bool) {
        let mut bitmap = BitmapView::new(&mut self.inode_bitmap);
        if !bitmap.test(local) {
            return;
        }
        bitmap.clear(local);
        self.inode_bitmap.mark_dirty();

        self.desc.bg_free_inodes_count += 1;
        if was_dir {
            self.desc.bg_used_dirs_count -= 1;
        }
        self.desc_dirty = true;
    }

    /// Releases data block `local` back to the group.
    pub fn free_block(&mut self, local: u32) {
        let mut bitmap = BitmapView::new(&mut self.block_bitmap);
        if !bitmap.test(local) {
            return;
        }
        bitmap.clear(local);
        self.block_bitmap.mark_dirty();

        self.desc.bg_free_blocks_count += 1;
        self.desc_dirty = true;
    }

    /// Set-bit count of the inode bitmap, for the integrity checker.
    pub fn used_inodes(&mut self) -> u32 {
        BitmapView::new(&mut self.inode_bitmap).count_set(INODES_PER_GROUP)
    }

    /// Set-bit count of the block bitmap, for the integrity checker.
    pub fn used_blocks(&mut self) -> u32 {
        BitmapView::new(&mut self.block_bitmap).count_set(BLOCKS_PER_GROUP)
    }

    /// Writes the group's dirty blocks back to the device.
    pub fn flush(&mut self, dev: &Device, cipher: &Cipher) -> CanFail<FsError> {
        if self.inode_bitmap.is_dirty() {
            self.inode_bitmap.flush(dev, cipher)?;
        }
        if self.block_bitmap.is_dirty() {
            self.block_bitmap.flush(dev, cipher)?;
        }
        for block in self.inode_table.values_mut() {
            if block.is_dirty() {
                block.flush(dev, cipher)?;
            }
        }
        Ok(())
    }
}
