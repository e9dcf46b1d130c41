//! Block cache.
//!
//! A fixed-capacity associative cache of data blocks keyed by global block
//! index. Replacement is CLOCK second-chance: every hit or fresh insertion
//! sets the entry's referenced bit; when capacity runs out the hand sweeps
//! the entries, stripping referenced bits until it lands on an unreferenced
//! victim. Dirty victims are written back through the cipher/device path
//! before being dropped.
//!
//! The cache is not internally synchronized; callers serialize access
//! through the engine lock.

use std::sync::Arc;

use hashbrown::HashMap;
use spin::RwLock;

use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::block::{Block, SharedBlock};

struct Entry {
    index: u32,
    block: SharedBlock,
    referenced: bool,
}

/// Bounded pool of in-memory data blocks with write-back on eviction.
pub struct BlockCache {
    slots: Vec<Entry>,
    map: HashMap<u32, usize>,
    hand: usize,
    capacity: usize,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            hand: 0,
            capacity: capacity.max(1),
        }
    }

    /// Looks up `index`. A hit sets the referenced bit and, when
    /// `mark_dirty` is given, the dirty bit.
    pub fn get(&mut self, index: u32, mark_dirty: bool) -> Option<SharedBlock> {
        let slot = *self.map.get(&index)?;
        let entry = &mut self.slots[slot];
        entry.referenced = true;
        if mark_dirty {
            entry.block.write().mark_dirty();
        }
        Some(entry.block.clone())
    }

    /// Inserts `block` under `index`, evicting a victim when full.
    ///
    /// Inserting an index that is already cached only refreshes the
    /// existing entry's referenced/dirty bits; the supplied block is
    /// discarded.
    pub fn insert(
        &mut self,
        dev: &Device,
        cipher: &Cipher,
        index: u32,
        mut block: Block,
        dirty: bool,
    ) -> FsResult<SharedBlock> {
        if let Some(&slot) = self.map.get(&index) {
            let entry = &mut self.slots[slot];
            entry.referenced = true;
            if dirty {
                entry.block.write().mark_dirty();
            }
            return Ok(entry.block.clone());
        }

        if dirty {
            block.mark_dirty();
        }
        let shared: SharedBlock = Arc::new(RwLock::new(block));

        if self.slots.len() < self.capacity {
            self.map.insert(index, self.slots.len());
            self.slots.push(Entry {
                index,
                block: shared.clone(),
                referenced: true,
            });
            return Ok(shared);
        }

        // CLOCK sweep: strip referenced bits until a victim turns up.
        loop {
            self.hand %= self.slots.len();
            if self.slots[self.hand].referenced {
                self.slots[self.hand].referenced = false;
                self.hand += 1;
                continue;
            }
            break;
        }

        let victim = &mut self.slots[self.hand];
        debug!("cache", "evicting block {}", victim.index);
        {
            let mut guard = victim.block.write();
            if guard.is_dirty() {
                guard.flush(dev, cipher)?;
            }
        }
        self.map.remove(&victim.index);
        self.map.insert(index, self.hand);
        *victim = Entry {
            index,
            block: shared.clone(),
            referenced: true,
        };
        self.hand += 1;

        Ok(shared)
    }

    /// Flags a cached block dirty after its content was mutated through an
    /// outstanding reference.
    pub fn modify(&mut self, index: u32) {
        if let Some(&slot) = self.map.get(&index) {
            self.slots[slot].block.write().mark_dirty();
        }
    }

    /// Drops the entry without write-back; used when the underlying block
    /// is freed.
    pub fn remove(&mut self, index: u32) {
        let Some(slot) = self.map.remove(&index) else {
            return;
        };
        self.slots.swap_remove(slot);
        if slot < self.slots.len() {
            self.map.insert(self.slots[slot].index, slot);
        }
        if self.hand >= self.slots.len() {
            self.hand = 0;
        }
    }

    /// Writes back every dirty entry without evicting.
    pub fn flush_all(&mut self, dev: &Device, cipher: &Cipher) -> CanFail<FsError> {
        for entry in &self.slots {
            let mut guard = entry.block.write();
            if guard.is_dirty() {
                guard.flush(dev, cipher)?;
            }
        }
        Ok(())
    }

    /// Writes back one entry, if present and dirty.
    pub fn flush_one(&mut self, index: u32, dev: &Device, cipher: &Cipher) -> CanFail<FsError> {
        if let Some(&slot) = self.map.get(&index) {
            let mut guard = self.slots[slot].block.write();
            if guard.is_dirty() {
                guard.flush(dev, cipher)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dev(name: &str) -> (Device, PathBuf) {
        let mut p = std::env::temp_dir();
        p.push(format!("vaultfs-bcache-{}-{name}", std::process::id()));
        let _ = std::fs::remove_file(&p);
        (Device::open(&p).unwrap(), p)
    }

    fn block_at(index: u32) -> Block {
        Block::zeroed(index as u64 * 4096)
    }

    #[test]
    fn hit_after_insert() {
        let (dev, path) = scratch_dev("hit");
        let cipher = Cipher::new(None);
        let mut cache = BlockCache::new(4);

        assert!(cache.get(7, false).is_none());
        cache.insert(&dev, &cipher, 7, block_at(7), false).unwrap();
        assert!(cache.get(7, false).is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn eviction_prefers_unreferenced() {
        let (dev, path) = scratch_dev("clock");
        let cipher = Cipher::new(None);
        let mut cache = BlockCache::new(2);

        cache.insert(&dev, &cipher, 1, block_at(1), false).unwrap();
        cache.insert(&dev, &cipher, 2, block_at(2), false).unwrap();
        // Re-reference 1 so the sweep strips it first and lands on 2.
        let _ = cache.get(1, false);

        cache.insert(&dev, &cipher, 3, block_at(3), false).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(3, false).is_some());
        // Exactly one of the old entries survived.
        let survivors = [1, 2]
            .iter()
            .filter(|&&i| cache.get(i, false).is_some())
            .count();
        assert_eq!(survivors, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn dirty_eviction_writes_back() {
        let (dev, path) = scratch_dev("dirty");
        let cipher = Cipher::new(None);
        let mut cache = BlockCache::new(1);

        let mut block = block_at(1);
        block.bytes_mut()[0] = 0xEE;
        cache.insert(&dev, &cipher, 1, block, true).unwrap();
        // Force the single slot to be recycled twice.
        cache.insert(&dev, &cipher, 2, block_at(2), false).unwrap();

        let loaded = Block::load(&dev, &cipher, 4096).unwrap();
        assert_eq!(loaded.bytes()[0], 0xEE);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_discards_entry() {
        let (dev, path) = scratch_dev("rm");
        let cipher = Cipher::new(None);
        let mut cache = BlockCache::new(4);

        cache.insert(&dev, &cipher, 1, block_at(1), true).unwrap();
        cache.remove(1);
        assert!(cache.get(1, false).is_none());
        assert_eq!(cache.len(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
