//! Filesystem core.
//!
//! Owns the on-disk layout: the superblock and its descriptor table, the
//! lazily-loaded block groups, the block cache and the dentry cache. On
//! top of those it implements path resolution, inode and block allocation
//! routing, the direct/indirect block-map traversal, and directory-record
//! management.
//!
//! Nothing in here is internally synchronized; the [`Engine`] serializes
//! access through its core lock.
//!
//! [`Engine`]: crate::engine::Engine

pub mod bitmap;
pub mod block;
pub mod block_grp;
pub mod dir;
pub mod inode;
pub mod path;
pub mod sb;

use hashbrown::HashMap;

use crate::cache::block::BlockCache;
use crate::cache::dentry::{DentryCache, NodeId, ROOT_NODE};
use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::block::{SharedBlock, BLOCK_SIZE};
use crate::fs::block_grp::BlockGroup;
use crate::fs::dir::{append_record, tombstone_record, DentryView, DirEntry};
use crate::fs::inode::{
    now, Inode, DIND_SLOT, IND_SLOT, NUM_DIRECT_BLOCKS, NUM_INDIRECT_BLOCKS, S_IFDIR, TIND_SLOT,
};
use crate::fs::sb::{
    GroupDesc, SuperBlock, BLOCKS_PER_GROUP, INODES_PER_GROUP, MAX_BLOCK_GROUP_SIZE, ROOT_INODE,
    SECTORS_PER_BLOCK,
};

/// First file-block ordinal served by the single-indirect level.
pub(crate) const IND_START: u64 = NUM_DIRECT_BLOCKS as u64;
/// First ordinal served by the double-indirect level.
pub(crate) const DIND_START: u64 = IND_START + NUM_INDIRECT_BLOCKS as u64;
/// First ordinal served by the triple-indirect level.
pub(crate) const TIND_START: u64 =
    DIND_START + (NUM_INDIRECT_BLOCKS as u64) * NUM_INDIRECT_BLOCKS as u64;
/// One past the last ordinal the block map can address.
pub(crate) const MAP_END: u64 = TIND_START
    + (NUM_INDIRECT_BLOCKS as u64) * NUM_INDIRECT_BLOCKS as u64 * NUM_INDIRECT_BLOCKS as u64;

/// Where a directory record lives on disk.
#[derive(Clone, Copy, Debug)]
pub struct RecordLoc {
    /// Global index of the directory block holding the record.
    pub block: u32,
    /// Byte offset of the record inside the block.
    pub offset: usize,
    pub inode: u32,
    pub file_type: u8,
}

/// The mounted filesystem: layout, allocators and caches.
pub struct FileSystem {
    pub(crate) dev: Device,
    pub(crate) cipher: Cipher,
    pub(crate) sb: SuperBlock,
    groups: HashMap<u32, BlockGroup>,
    cache: BlockCache,
    pub(crate) dcache: DentryCache,
}

impl FileSystem {
    /// Brings the image up: loads (or formats) block 0, materializes group
    /// 0 and makes sure the root inode exists.
    pub fn mount(dev: Device, cipher: Cipher, cache_capacity: usize) -> FsResult<Self> {
        let sb = SuperBlock::load(&dev, &cipher)?;
        let mut fs = Self {
            dev,
            cipher,
            sb,
            groups: HashMap::new(),
            cache: BlockCache::new(cache_capacity),
            dcache: DentryCache::new(),
        };

        fs.group(0)?;
        fs.ensure_root()?;
        Ok(fs)
    }

    fn ensure_root(&mut self) -> FsResult<()> {
        let grp = Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, 0)?;
        if grp
            .get_inode(&self.dev, &self.cipher, ROOT_INODE)?
            .is_some()
        {
            return Ok(());
        }

        let index = self.alloc_inode(true)?;
        if index != ROOT_INODE {
            return Err(FsError::IoError);
        }
        let root = Inode::create(S_IFDIR | 0o755, now());
        self.write_inode(ROOT_INODE, &root)?;
        info!("ext2", "created root inode");
        Ok(())
    }

    fn load_group<'a>(
        groups: &'a mut HashMap<u32, BlockGroup>,
        sb: &SuperBlock,
        dev: &Device,
        cipher: &Cipher,
        index: u32,
    ) -> FsResult<&'a mut BlockGroup> {
        if !groups.contains_key(&index) {
            let desc = sb.group_desc(index).ok_or(FsError::NotFound)?;
            groups.insert(index, BlockGroup::load(dev, cipher, index, desc)?);
        }
        groups.get_mut(&index).ok_or(FsError::NullPtr)
    }

    /// The group `index`, loaded lazily from its descriptor.
    pub fn group(&mut self, index: u32) -> FsResult<&mut BlockGroup> {
        Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, index)
    }

    /// Copies out the inode `index`.
    pub fn read_inode(&mut self, index: u32) -> FsResult<Inode> {
        let group = SuperBlock::inode_group(index);
        let local = SuperBlock::inode_local(index);
        let grp = Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, group)?;
        grp.get_inode(&self.dev, &self.cipher, local)?
            .ok_or(FsError::NotFound)
    }

    /// Writes `inode` back into its table slot.
    pub fn write_inode(&mut self, index: u32, inode: &Inode) -> CanFail<FsError> {
        let group = SuperBlock::inode_group(index);
        let local = SuperBlock::inode_local(index);
        let grp = Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, group)?;
        grp.put_inode(&self.dev, &self.cipher, local, inode)
    }

    /// Fetches the data block `index` through the cache, loading it from
    /// its owning group on a miss. `mark_dirty` flags the entry for
    /// write-back.
    pub fn get_block(&mut self, index: u32, mark_dirty: bool) -> FsResult<SharedBlock> {
        if let Some(block) = self.cache.get(index, mark_dirty) {
            return Ok(block);
        }

        let group = SuperBlock::block_group(index);
        let local = SuperBlock::block_local(index);
        let grp = Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, group)?;
        let block = grp
            .get_block(&self.dev, &self.cipher, local)?
            .ok_or(FsError::IoError)?;
        self.cache
            .insert(&self.dev, &self.cipher, index, block, mark_dirty)
    }

    /// Allocates an inode, trying every group with spare capacity and
    /// materializing a fresh group when all are full. Returns the global
    /// inode index.
    pub fn alloc_inode(&mut self, is_dir: bool) -> FsResult<u32> {
        for pass in 0..2 {
            for g in 0..self.sb.num_groups() {
                let grp =
                    Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, g)?;
                if grp.desc().bg_free_inodes_count == 0 {
                    continue;
                }
                if let Some(local) = grp.alloc_inode(&self.dev, &self.cipher, is_dir)? {
                    self.sb.raw_mut().s_free_inodes_count -= 1;
                    return Ok(g * INODES_PER_GROUP + local);
                }
            }
            if pass == 0 {
                self.alloc_block_group()?;
            }
        }
        Err(FsError::IoError)
    }

    /// Allocates a zeroed data block and inserts it into the cache dirty.
    /// Returns the global block index.
    pub fn alloc_block(&mut self) -> FsResult<(u32, SharedBlock)> {
        for pass in 0..2 {
            for g in 0..self.sb.num_groups() {
                let grp =
                    Self::load_group(&mut self.groups, &self.sb, &self.dev, &self.cipher, g)?;
                if grp.desc().bg_free_blocks_count == 0 {
                    continue;
                }
                if let Some((local, block)) = grp.alloc_block()? {
                    self.sb.raw_mut().s_free_blocks_count -= 1;
                    let index = g * BLOCKS_PER_GROUP + local;
                    let shared = self
                        .cache
                        .insert(&self.dev, &self.cipher, index, block, true)?;
                    return Ok((index, shared));
                }
            }
            if pass == 0 {
                self.alloc_block_group()?;
            }
        }
        Err(FsError::IoError)
    }

    /// Appends a descriptor for a brand-new group after the existing ones.
    fn alloc_block_group(&mut self) -> FsResult<u32> {
        let index = self.sb.num_groups();
        let base = index as u64 * MAX_BLOCK_GROUP_SIZE;

        // Descriptors store byte offsets in 32 bits; past that the image
        // cannot grow.
        if base + 3 * BLOCK_SIZE as u64 > u32::MAX as u64 {
            error!("ext2", "block group {index} is beyond the addressable image");
            return Err(FsError::Invalid);
        }

        let desc = GroupDesc {
            bg_inode_bitmap: (base + BLOCK_SIZE as u64) as u32,
            bg_block_bitmap: (base + 2 * BLOCK_SIZE as u64) as u32,
            bg_inode_table: (base + 3 * BLOCK_SIZE as u64) as u32,
            bg_free_blocks_count: BLOCKS_PER_GROUP as u16,
            bg_free_inodes_count: INODES_PER_GROUP as u16,
            bg_used_dirs_count: 0,
            _pad: 0,
            _reserved: [0; 12],
        };
        self.sb.push_desc(&desc)?;

        let raw = self.sb.raw_mut();
        raw.s_blocks_count += BLOCKS_PER_GROUP;
        raw.s_inodes_count += INODES_PER_GROUP;
        raw.s_free_blocks_count += BLOCKS_PER_GROUP;
        raw.s_free_inodes_count += INODES_PER_GROUP;

        self.groups.insert(index, BlockGroup::init(index, desc));
        info!("ext2", "materialized block group {index}");
        Ok(index)
    }

    /// Frees the data block `index` and drops it from the cache.
    pub fn release_block(&mut self, index: u32) -> CanFail<FsError> {
        self.cache.remove(index);
        let group = SuperBlock::block_group(index);
        let local = SuperBlock::block_local(index);
        self.group(group)?.free_block(local);
        self.sb.raw_mut().s_free_blocks_count += 1;
        Ok(())
    }

    /// Clears the inode bit of `index` and updates the counters.
    pub fn release_inode(&mut self, index: u32, was_dir: bool) -> CanFail<FsError> {
        let group = SuperBlock::inode_group(index);
        let local = SuperBlock::inode_local(index);
        self.group(group)?.free_inode(local, was_dir);
        self.sb.raw_mut().s_free_inodes_count += 1;
        Ok(())
    }

    /// Reads entry `i` of the indirect block `block`.
    pub fn indirect_entry(&mut self, block: u32, i: u32) -> FsResult<u32> {
        let shared = self.get_block(block, false)?;
        let guard = shared.read();
        let at = i as usize * 4;
        let bytes = guard.bytes();
        Ok(u32::from_le_bytes([
            bytes[at],
            bytes[at + 1],
            bytes[at + 2],
            bytes[at + 3],
        ]))
    }

    /// Writes entry `i` of the indirect block `block`.
    pub fn set_indirect_entry(&mut self, block: u32, i: u32, val: u32) -> CanFail<FsError> {
        let shared = self.get_block(block, true)?;
        let mut guard = shared.write();
        let at = i as usize * 4;
        guard.bytes_mut()[at..at + 4].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// Copies out all entries of an indirect block.
    fn indirect_entries(&mut self, block: u32) -> FsResult<Vec<u32>> {
        let shared = self.get_block(block, false)?;
        let guard = shared.read();
        Ok(guard
            .bytes()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Global indices of every allocated data block of `inode`, in file
    /// order.
    pub fn inode_block_indices(&mut self, inode: &Inode) -> FsResult<Vec<u32>> {
        let mut left = inode.num_blocks();
        let mut out = Vec::with_capacity(left as usize);

        for k in 0..NUM_DIRECT_BLOCKS {
            if left == 0 {
                return Ok(out);
            }
            out.push(inode.i_block[k]);
            left -= 1;
        }
        for (slot, depth) in [(IND_SLOT, 1), (DIND_SLOT, 2), (TIND_SLOT, 3)] {
            if left == 0 {
                break;
            }
            self.collect_indirect(inode.i_block[slot], depth, &mut left, &mut out)?;
        }
        Ok(out)
    }

    fn collect_indirect(
        &mut self,
        block: u32,
        depth: u8,
        left: &mut u32,
        out: &mut Vec<u32>,
    ) -> CanFail<FsError> {
        let entries = self.indirect_entries(block)?;
        for entry in entries {
            if *left == 0 {
                return Ok(());
            }
            if depth == 1 {
                out.push(entry);
                *left -= 1;
            } else {
                self.collect_indirect(entry, depth - 1, left, out)?;
            }
        }
        Ok(())
    }

    /// Yields every allocated data block of `inode` in file order until
    /// the visitor returns `Ok(false)`.
    pub fn visit_inode_blocks<F>(&mut self, inode: &Inode, mut visitor: F) -> CanFail<FsError>
    where
        F: FnMut(u32, &SharedBlock) -> FsResult<bool>,
    {
        for index in self.inode_block_indices(inode)? {
            let block = self.get_block(index, false)?;
            if !visitor(index, &block)? {
                break;
            }
        }
        Ok(())
    }

    /// Allocates a fresh data block and wires it into `inode`'s block map
    /// at the next file position, allocating indirect levels as
    /// boundaries are crossed. `i_blocks` is advanced; the caller
    /// persists the inode.
    pub fn append_block(&mut self, inode: &mut Inode) -> FsResult<(u32, SharedBlock)> {
        let n = inode.num_blocks() as u64;
        if n >= MAP_END {
            return Err(FsError::Invalid);
        }

        let (index, shared) = self.alloc_block()?;
        let nind = NUM_INDIRECT_BLOCKS as u64;

        if n < IND_START {
            inode.i_block[n as usize] = index;
        } else if n < DIND_START {
            if n == IND_START {
                let (root, _) = self.alloc_block()?;
                inode.i_block[IND_SLOT] = root;
            }
            self.set_indirect_entry(inode.i_block[IND_SLOT], (n - IND_START) as u32, index)?;
        } else if n < TIND_START {
            let m = n - DIND_START;
            let (i1, i2) = ((m / nind) as u32, (m % nind) as u32);
            if m == 0 {
                let (root, _) = self.alloc_block()?;
                inode.i_block[DIND_SLOT] = root;
            }
            if i2 == 0 {
                let (leaf, _) = self.alloc_block()?;
                self.set_indirect_entry(inode.i_block[DIND_SLOT], i1, leaf)?;
            }
            let leaf = self.indirect_entry(inode.i_block[DIND_SLOT], i1)?;
            self.set_indirect_entry(leaf, i2, index)?;
        } else {
            let m = n - TIND_START;
            let i1 = (m / (nind * nind)) as u32;
            let i2 = ((m / nind) % nind) as u32;
            let i3 = (m % nind) as u32;
            if m == 0 {
                let (root, _) = self.alloc_block()?;
                inode.i_block[TIND_SLOT] = root;
            }
            if i2 == 0 && i3 == 0 {
                let (mid, _) = self.alloc_block()?;
                self.set_indirect_entry(inode.i_block[TIND_SLOT], i1, mid)?;
            }
            let mid = self.indirect_entry(inode.i_block[TIND_SLOT], i1)?;
            if i3 == 0 {
                let (leaf, _) = self.alloc_block()?;
                self.set_indirect_entry(mid, i2, leaf)?;
            }
            let leaf = self.indirect_entry(mid, i2)?;
            self.set_indirect_entry(leaf, i3, index)?;
        }

        inode.i_blocks += SECTORS_PER_BLOCK;
        Ok((index, shared))
    }

    /// Resolves `components` from the root, probing the dentry cache
    /// before each on-disk directory scan. Returns the inode index and a
    /// copy of the inode.
    pub fn inode_lookup(&mut self, components: &[&[u8]]) -> FsResult<(u32, Inode)> {
        let mut cur_index = ROOT_INODE;
        let mut cur = self.read_inode(cur_index)?;
        let mut cnode: NodeId = ROOT_NODE;

        for comp in components {
            if !cur.is_dir() {
                return Err(FsError::NotADirectory);
            }

            if let Some(hit) = self.dcache.lookup(cnode, comp) {
                cnode = hit;
                cur_index = self.dcache.inode(hit);
                cur = self.read_inode(cur_index)?;
                continue;
            }

            match self.scan_dir(&cur, comp)? {
                Some(loc) => {
                    cnode = self.dcache.insert(cnode, comp, loc.inode);
                    cur_index = loc.inode;
                    cur = self.read_inode(cur_index)?;
                }
                None => return Err(FsError::NotFound),
            }
        }

        Ok((cur_index, cur))
    }

    /// Scans `dir`'s blocks in file order for the live record named
    /// `name`.
    pub fn scan_dir(&mut self, dir: &Inode, name: &[u8]) -> FsResult<Option<RecordLoc>> {
        for index in self.inode_block_indices(dir)? {
            let shared = self.get_block(index, false)?;
            let guard = shared.read();
            if let Some(rec) = DentryView::new(guard.bytes()).find(name) {
                return Ok(Some(RecordLoc {
                    block: index,
                    offset: rec.offset,
                    inode: rec.inode,
                    file_type: rec.file_type,
                }));
            }
        }
        Ok(None)
    }

    /// Appends a `name → inode` record to the directory, growing it by
    /// one block when the last block cannot take the record. The caller
    /// persists `dir`.
    pub fn dir_add_record(
        &mut self,
        dir: &mut Inode,
        name: &[u8],
        inode: u32,
        file_type: u8,
    ) -> CanFail<FsError> {
        let indices = self.inode_block_indices(dir)?;
        if let Some(&last) = indices.last() {
            let shared = self.get_block(last, false)?;
            let mut guard = shared.write();
            if append_record(guard.bytes_mut(), name, inode, file_type).is_some() {
                drop(guard);
                self.cache.modify(last);
                return Ok(());
            }
        }

        let (_, shared) = self.append_block(dir)?;
        let mut guard = shared.write();
        if append_record(guard.bytes_mut(), name, inode, file_type).is_none() {
            return Err(FsError::NullPtr);
        }
        dir.i_size += BLOCK_SIZE as u32;
        Ok(())
    }

    /// Live entries of the directory, in storage order. `.` and `..` are
    /// not stored and not returned.
    pub fn dir_entries(&mut self, dir: &Inode) -> FsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        self.visit_inode_blocks(dir, |_, shared| {
            let guard = shared.read();
            for rec in DentryView::new(guard.bytes()).records() {
                if !rec.name.is_empty() {
                    entries.push(DirEntry {
                        name: rec.name.to_vec(),
                        inode: rec.inode,
                        file_type: rec.file_type,
                    });
                }
            }
            Ok(true)
        })?;
        Ok(entries)
    }

    /// Whether every record of the directory is a tombstone.
    pub fn dir_is_empty(&mut self, dir: &Inode) -> FsResult<bool> {
        let mut empty = true;
        self.visit_inode_blocks(dir, |_, shared| {
            let guard = shared.read();
            if DentryView::new(guard.bytes())
                .records()
                .any(|r| !r.name.is_empty())
            {
                empty = false;
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(empty)
    }

    /// Tombstones the record at `loc` and flags its block dirty.
    pub fn tombstone(&mut self, loc: &RecordLoc) -> CanFail<FsError> {
        let shared = self.get_block(loc.block, true)?;
        let mut guard = shared.write();
        tombstone_record(guard.bytes_mut(), loc.offset);
        Ok(())
    }

    /// Creates the inode for `components` under its parent directory.
    ///
    /// When the name already exists the existing inode index is returned
    /// with `created == false`; the caller decides whether that is an
    /// error.
    pub fn inode_create(&mut self, components: &[&[u8]], mode: u16) -> FsResult<(u32, bool)> {
        let (name, parent_comps) = match components.split_last() {
            Some((name, rest)) => (*name, rest),
            None => return Err(FsError::Invalid),
        };

        let (parent_index, mut parent) = self.inode_lookup(parent_comps)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }

        if let Some(existing) = self.scan_dir(&parent, name)? {
            return Ok((existing.inode, false));
        }

        let is_dir = mode & inode::S_IFMT == S_IFDIR;
        let index = self.alloc_inode(is_dir)?;
        let stamp = now();
        self.write_inode(index, &Inode::create(mode, stamp))?;

        self.dir_add_record(&mut parent, name, index, (mode >> 12) as u8)?;
        parent.i_mtime = stamp;
        self.write_inode(parent_index, &parent)?;

        if let Some(pnode) = self.dcache.resolve(parent_comps) {
            self.dcache.insert(pnode, name, index);
        }

        debug!("ext2", "created inode {index}");
        Ok((index, true))
    }

    /// Frees every block referenced by `inode` through all four
    /// indirection levels, including the indirect blocks themselves.
    fn free_inode_blocks(&mut self, inode: &Inode) -> CanFail<FsError> {
        let mut left = inode.num_blocks();
        for k in 0..NUM_DIRECT_BLOCKS {
            if left == 0 {
                return Ok(());
            }
            self.release_block(inode.i_block[k])?;
            left -= 1;
        }
        for (slot, depth) in [(IND_SLOT, 1), (DIND_SLOT, 2), (TIND_SLOT, 3)] {
            if left == 0 {
                break;
            }
            self.free_block_tree(inode.i_block[slot], depth, &mut left)?;
        }
        Ok(())
    }

    fn free_block_tree(&mut self, block: u32, depth: u8, left: &mut u32) -> CanFail<FsError> {
        if depth == 0 {
            *left -= 1;
            return self.release_block(block);
        }
        let entries = self.indirect_entries(block)?;
        for entry in entries {
            if *left == 0 {
                break;
            }
            self.free_block_tree(entry, depth - 1, left)?;
        }
        self.release_block(block)
    }

    /// Deletes the inode `index`: directories lose their children
    /// recursively, then every owned block and the inode itself are
    /// freed.
    pub fn inode_delete(&mut self, index: u32) -> CanFail<FsError> {
        let mut inode = self.read_inode(index)?;

        if inode.is_dir() {
            let children: Vec<u32> = self
                .dir_entries(&inode)?
                .into_iter()
                .map(|e| e.inode)
                .collect();
            for child in children {
                self.inode_delete(child)?;
            }
        }

        self.free_inode_blocks(&inode)?;

        inode.i_dtime = now();
        inode.i_links_count = 0;
        self.write_inode(index, &inode)?;
        self.release_inode(index, inode.is_dir())?;
        debug!("ext2", "deleted inode {index}");
        Ok(())
    }

    /// Frees the data blocks of `inode` past the first `keep` file
    /// blocks, dropping indirect blocks that no longer carry any kept
    /// leaf. `i_blocks` is updated; the caller persists the inode.
    pub fn truncate_blocks(&mut self, inode: &mut Inode, keep: u32) -> CanFail<FsError> {
        let total = inode.num_blocks();
        if keep >= total {
            return Ok(());
        }

        let mut left = total;
        let mut kept = keep;
        for k in 0..NUM_DIRECT_BLOCKS {
            if left == 0 {
                break;
            }
            left -= 1;
            if kept > 0 {
                kept -= 1;
            } else {
                self.release_block(inode.i_block[k])?;
                inode.i_block[k] = 0;
            }
        }
        for (slot, depth) in [(IND_SLOT, 1), (DIND_SLOT, 2), (TIND_SLOT, 3)] {
            if left == 0 {
                break;
            }
            if self.trim_block_tree(inode.i_block[slot], depth, &mut left, &mut kept)? {
                inode.i_block[slot] = 0;
            }
        }

        inode.i_blocks = keep * SECTORS_PER_BLOCK;
        Ok(())
    }

    /// Returns whether `block` itself was freed, which happens when no
    /// kept leaf remains below it.
    fn trim_block_tree(
        &mut self,
        block: u32,
        depth: u8,
        left: &mut u32,
        kept: &mut u32,
    ) -> FsResult<bool> {
        if depth == 0 {
            *left -= 1;
            if *kept > 0 {
                *kept -= 1;
                return Ok(false);
            }
            self.release_block(block)?;
            return Ok(true);
        }

        let entries = self.indirect_entries(block)?;
        let mut any_kept = false;
        for entry in entries {
            if *left == 0 {
                break;
            }
            if !self.trim_block_tree(entry, depth - 1, left, kept)? {
                any_kept = true;
            }
        }
        if any_kept {
            return Ok(false);
        }
        self.release_block(block)?;
        Ok(true)
    }

    /// Writes back one cached block, if present and dirty.
    pub fn flush_block(&mut self, index: u32) -> CanFail<FsError> {
        self.cache.flush_one(index, &self.dev, &self.cipher)
    }

    /// Writes every dirty structure back to the device: cached data
    /// blocks, group bitmaps and inode tables, the descriptor table and
    /// the superblock.
    pub fn flush(&mut self) -> CanFail<FsError> {
        debug!(
            "ext2",
            "flush: {} cached blocks, {} dentry nodes",
            self.cache.len(),
            self.dcache.len()
        );
        self.cache.flush_all(&self.dev, &self.cipher)?;
        for (&index, group) in self.groups.iter_mut() {
            group.flush(&self.dev, &self.cipher)?;
            if group.desc_dirty() {
                self.sb.write_desc(index, group.desc());
                group.clear_desc_dirty();
            }
        }
        self.sb.flush(&self.dev, &self.cipher)?;
        self.dev.sync()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> (FileSystem, PathBuf) {
        let mut p = std::env::temp_dir();
        p.push(format!("vaultfs-core-{}-{name}.img", std::process::id()));
        let _ = std::fs::remove_file(&p);
        let dev = Device::open(&p).unwrap();
        let fs = FileSystem::mount(dev, Cipher::new(None), 64).unwrap();
        (fs, p)
    }

    fn comps<'a>(parts: &[&'a str]) -> Vec<&'a [u8]> {
        parts.iter().map(|p| p.as_bytes()).collect()
    }

    #[test]
    fn format_creates_root() {
        let (mut fs, path) = scratch("root");
        let (index, root) = fs.inode_lookup(&[]).unwrap();
        assert_eq!(index, ROOT_INODE);
        assert!(root.is_dir());
        assert_eq!(root.i_links_count, 1);
        assert_eq!(root.i_size, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn create_then_lookup() {
        let (mut fs, path) = scratch("create");
        let dir = comps(&["home"]);
        let (dir_index, created) = fs.inode_create(&dir, S_IFDIR | 0o755).unwrap();
        assert!(created);

        let file = comps(&["home", "test.txt"]);
        let (file_index, created) = fs.inode_create(&file, inode::S_IFREG | 0o644).unwrap();
        assert!(created);
        assert_ne!(dir_index, file_index);

        let (found, ino) = fs.inode_lookup(&file).unwrap();
        assert_eq!(found, file_index);
        assert!(ino.is_regular());

        // Creating again reports the existing inode.
        let (again, created) = fs.inode_create(&file, inode::S_IFREG | 0o644).unwrap();
        assert!(!created);
        assert_eq!(again, file_index);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn lookup_error_kinds() {
        let (mut fs, path) = scratch("notdir");
        fs.inode_create(&comps(&["f"]), inode::S_IFREG | 0o644)
            .unwrap();

        let err = fs.inode_lookup(&comps(&["f", "x"])).unwrap_err();
        assert_eq!(err, FsError::NotADirectory);

        let err = fs.inode_lookup(&comps(&["missing"])).unwrap_err();
        assert_eq!(err, FsError::NotFound);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn append_block_crosses_indirect_boundary() {
        let (mut fs, path) = scratch("indirect");
        let (index, _) = fs
            .inode_create(&comps(&["big"]), inode::S_IFREG | 0o644)
            .unwrap();
        let mut ino = fs.read_inode(index).unwrap();

        for _ in 0..13 {
            fs.append_block(&mut ino).unwrap();
        }
        fs.write_inode(index, &ino).unwrap();

        assert_eq!(ino.num_blocks(), 13);
        assert_ne!(ino.i_block[IND_SLOT], 0);
        assert_eq!(ino.i_block[DIND_SLOT], 0);

        let indices = fs.inode_block_indices(&ino).unwrap();
        assert_eq!(indices.len(), 13);
        // The 13th data block is the first entry of the indirect block.
        let first = fs.indirect_entry(ino.i_block[IND_SLOT], 0).unwrap();
        assert_eq!(first, indices[12]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncate_blocks_frees_tail() {
        let (mut fs, path) = scratch("trunc");
        let (index, _) = fs
            .inode_create(&comps(&["t"]), inode::S_IFREG | 0o644)
            .unwrap();
        let mut ino = fs.read_inode(index).unwrap();
        for _ in 0..20 {
            fs.append_block(&mut ino).unwrap();
        }

        let free_before = fs.sb.raw().s_free_blocks_count;
        fs.truncate_blocks(&mut ino, 5).unwrap();
        fs.write_inode(index, &ino).unwrap();

        assert_eq!(ino.num_blocks(), 5);
        // 15 data blocks plus the now-empty indirect block came back.
        assert_eq!(fs.sb.raw().s_free_blocks_count, free_before + 16);
        assert_eq!(ino.i_block[IND_SLOT], 0);
        assert_eq!(fs.inode_block_indices(&ino).unwrap().len(), 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn saturated_group_materializes_next() {
        let (mut fs, path) = scratch("grow");
        // Saturate group 0's block bitmap by hand.
        {
            let grp = fs.group(0).unwrap();
            while grp.alloc_block().unwrap().is_some() {}
        }
        fs.sb.raw_mut().s_free_blocks_count = 0;
        let capacity = fs.sb.raw().s_blocks_count;
        assert_eq!(fs.sb.num_groups(), 1);

        let (index, _) = fs.alloc_block().unwrap();
        assert_eq!(fs.sb.num_groups(), 2);
        assert_eq!(index, BLOCKS_PER_GROUP);
        assert_eq!(fs.sb.raw().s_blocks_count, capacity + BLOCKS_PER_GROUP);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn delete_returns_all_blocks() {
        let (mut fs, path) = scratch("delete");
        let (index, _) = fs
            .inode_create(&comps(&["d"]), inode::S_IFREG | 0o644)
            .unwrap();
        let mut ino = fs.read_inode(index).unwrap();
        for _ in 0..15 {
            fs.append_block(&mut ino).unwrap();
        }
        fs.write_inode(index, &ino).unwrap();

        let free_inodes = fs.sb.raw().s_free_inodes_count;
        let free_blocks = fs.sb.raw().s_free_blocks_count;

        fs.inode_delete(index).unwrap();

        // 15 data blocks plus one indirect block.
        assert_eq!(fs.sb.raw().s_free_blocks_count, free_blocks + 16);
        assert_eq!(fs.sb.raw().s_free_inodes_count, free_inodes + 1);
        assert!(fs.read_inode(index).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unmount_and_remount_preserves_tree() {
        let (mut fs, path) = scratch("remount");
        fs.inode_create(&comps(&["home"]), S_IFDIR | 0o755).unwrap();
        let (file_index, _) = fs
            .inode_create(&comps(&["home", "a"]), inode::S_IFREG | 0o644)
            .unwrap();
        fs.flush().unwrap();
        drop(fs);

        let dev = Device::open(&path).unwrap();
        let mut fs = FileSystem::mount(dev, Cipher::new(None), 64).unwrap();
        let (found, ino) = fs.inode_lookup(&comps(&["home", "a"])).unwrap();
        assert_eq!(found, file_index);
        assert!(ino.is_regular());
        let _ = std::fs::remove_file(&path);
    }
}
