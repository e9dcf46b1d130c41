//! Open-file handles and the shared inode cache.
//!
//! Every open file is backed by an [`InodeCache`]: the authoritative
//! in-memory copy of the inode, shared by all handles currently open on
//! it, reference counted by the [`OpManager`] and guarded by a
//! reader-writer lock. Data-path reads take the lock shared; writes that
//! grow the file take it exclusive.
//!
//! Each handle additionally owns a seek cursor over the block map,
//! guarded by its own mutex so concurrent calls on the same handle
//! serialize. When a writer reshapes the block map, every sibling
//! handle's cursor is flagged stale and re-seeks lazily.
//!
//! Lock order, outermost first: handle cursor, the inode-cache table, a
//! per-inode rwlock, the engine core lock. No path acquires them in any
//! other order.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::error::{FsError, FsResult};
use crate::fs::inode::Inode;
use crate::fs::FileSystem;

/// How a handle may be used, from the open flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Decoded open flags.
#[derive(Clone, Copy, Debug)]
pub struct OpenFlags {
    pub access: Access,
    /// Writes always start at the current end of file.
    pub append: bool,
}

impl OpenFlags {
    /// Decodes POSIX open(2) flag bits.
    pub fn from_bits(flags: i32) -> FsResult<Self> {
        let access = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Access::ReadOnly,
            libc::O_WRONLY => Access::WriteOnly,
            libc::O_RDWR => Access::ReadWrite,
            _ => return Err(FsError::Invalid),
        };
        Ok(Self {
            access,
            append: flags & libc::O_APPEND != 0,
        })
    }

    pub fn read_write() -> Self {
        Self {
            access: Access::ReadWrite,
            append: false,
        }
    }

    pub fn readable(&self) -> bool {
        self.access != Access::WriteOnly
    }

    pub fn writable(&self) -> bool {
        self.access != Access::ReadOnly
    }
}

/// Seek state of one handle: the current file-block ordinal, its global
/// block index, and the indirect-block chain used to reach it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursor {
    /// Ordinal of the current block within the file.
    pub file_block: u64,
    /// Global index of the current block.
    pub block: u32,
    /// Cached indirect-block indices for the levels currently in use.
    pub ind: [u32; 3],
}

/// The shared in-memory copy of one inode.
pub struct InodeCache {
    index: u32,
    inode: RwLock<Inode>,
    refs: AtomicU32,
    handles: Mutex<Vec<Weak<FileHandle>>>,
}

impl InodeCache {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The rwlock guarding the cached inode.
    pub fn inode(&self) -> &RwLock<Inode> {
        &self.inode
    }

    /// Registers a live handle for [`InodeCache::upd_all`] notifications.
    pub fn attach(&self, handle: &Arc<FileHandle>) {
        self.handles.lock().push(Arc::downgrade(handle));
    }

    /// Drops a released handle from the notification list.
    pub fn detach(&self, handle: &Arc<FileHandle>) {
        self.handles
            .lock()
            .retain(|w| w.upgrade().is_some_and(|h| !Arc::ptr_eq(&h, handle)));
    }

    /// Flags every live handle's cursor stale; each re-seeks from
    /// `i_block` on its next operation.
    pub fn upd_all(&self) {
        for weak in self.handles.lock().iter() {
            if let Some(handle) = weak.upgrade() {
                handle.stale.store(true, Ordering::Release);
            }
        }
    }
}

/// One open file.
pub struct FileHandle {
    pub(crate) cache: Arc<InodeCache>,
    pub(crate) cursor: Mutex<Cursor>,
    pub(crate) stale: AtomicBool,
    pub(crate) flags: OpenFlags,
}

/// A client's reference to an open file.
pub type Handle = Arc<FileHandle>;

impl FileHandle {
    /// Global index of the inode this handle is open on.
    pub fn inode_index(&self) -> u32 {
        self.cache.index()
    }

    pub(crate) fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }
}

/// Owns the `inode index → InodeCache` table.
pub struct OpManager {
    table: Mutex<HashMap<u32, Arc<InodeCache>>>,
}

impl OpManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cache entry for `index`, constructing it from the
    /// on-disk inode on first use, and bumps its reference count.
    pub fn get_cache(
        &self,
        fs: &Mutex<FileSystem>,
        index: u32,
    ) -> FsResult<Arc<InodeCache>> {
        let mut table = self.table.lock();
        if let Some(cache) = table.get(&index) {
            cache.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(cache.clone());
        }

        let inode = fs.lock().read_inode(index)?;
        let cache = Arc::new(InodeCache {
            index,
            inode: RwLock::new(inode),
            refs: AtomicU32::new(1),
            handles: Mutex::new(Vec::new()),
        });
        table.insert(index, cache.clone());
        Ok(cache)
    }

    /// The cache entry for `index` if one is live; does not bump the
    /// reference count.
    pub fn existing(&self, index: u32) -> Option<Arc<InodeCache>> {
        self.table.lock().get(&index).cloned()
    }

    /// Drops one reference on `index`. When the last reference goes away
    /// the entry is removed and its final inode copy returned so the
    /// caller can commit it (and reap the inode if its link count hit
    /// zero while handles were still open).
    pub fn rel_cache(&self, index: u32) -> Option<Inode> {
        let mut table = self.table.lock();
        let cache = table.get(&index)?;
        if cache.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let inode = *cache.inode.read();
        table.remove(&index);
        Some(inode)
    }

    /// Copies of every live cache entry, for committing back to disk.
    /// Taken without holding any other lock so callers can write them
    /// out under the core lock without inverting the lock order.
    pub fn snapshot(&self) -> Vec<(u32, Inode)> {
        self.table
            .lock()
            .iter()
            .map(|(&index, cache)| (index, *cache.inode().read()))
            .collect()
    }

    /// Live cache entries.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl Default for OpManager {
    fn default() -> Self {
        Self::new()
    }
}
