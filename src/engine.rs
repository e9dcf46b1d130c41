//! The storage engine.
//!
//! [`Engine`] is the single owned value the bridge layer talks to: it is
//! constructed by [`Engine::mount`], serves every operation the bridge
//! dispatches, and tears the image down in [`Engine::unmount`]. Metadata
//! operations serialize on the core lock around the filesystem state;
//! the data path only takes that lock briefly per block and synchronizes
//! on the per-inode and per-handle locks of the handle manager.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use spin::Mutex;

use crate::crypto::Cipher;
use crate::device::Device;
use crate::error::{CanFail, FsError, FsResult};
use crate::fs::block::BLOCK_SIZE;
use crate::fs::dir::{DirEntry, FILE_TYPE_DIR};
use crate::fs::inode::{now, Inode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::fs::path::Path;
use crate::fs::{FileSystem, DIND_START, IND_START, MAP_END, TIND_START};
use crate::handle::{Cursor, FileHandle, Handle, OpenFlags, OpManager};

/// `rename` flag: fail instead of replacing an existing destination.
pub const RENAME_NOREPLACE: u32 = 1;

const BS: u64 = BLOCK_SIZE as u64;
const NIND: u64 = crate::fs::inode::NUM_INDIRECT_BLOCKS as u64;

/// Bytes a symlink target may occupy inside the `i_block` array before it
/// spills into a data block.
const INLINE_SYMLINK_MAX: usize = 60;

/// Mount-time configuration.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Path of the backing device or image file.
    pub device: PathBuf,
    /// Password for encryption at rest; `None` mounts in the clear.
    pub password: Option<String>,
    /// Capacity of the block cache, in blocks.
    pub cache_capacity: usize,
}

impl MountOptions {
    pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            password: None,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

/// File metadata as reported to the bridge.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub ino: u32,
    pub mode: u16,
    pub nlink: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    /// 512-byte sectors of file data, as stored in `i_blocks`.
    pub blocks: u32,
    pub blksize: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FileStat {
    fn new(ino: u32, inode: &Inode) -> Self {
        Self {
            ino,
            mode: inode.i_mode,
            nlink: inode.i_links_count,
            uid: inode.i_uid,
            gid: inode.i_gid,
            size: inode.i_size as u64,
            blocks: inode.i_blocks,
            blksize: BLOCK_SIZE as u32,
            atime: inode.i_atime,
            mtime: inode.i_mtime,
            ctime: inode.i_ctime,
        }
    }
}

/// Filesystem-wide counters, for `statfs` and the checker.
#[derive(Clone, Copy, Debug)]
pub struct FsStats {
    pub blocks: u32,
    pub free_blocks: u32,
    pub inodes: u32,
    pub free_inodes: u32,
}

/// The mounted storage engine.
pub struct Engine {
    fs: Mutex<FileSystem>,
    opm: OpManager,
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("open_inodes", &self.opm.len())
            .finish()
    }
}

impl Engine {
    /// Opens the device, authenticates (or formats) the image and brings
    /// the engine up.
    pub fn mount(opts: MountOptions) -> FsResult<Self> {
        let dev = Device::open(&opts.device)?;
        let cipher = Cipher::new(opts.password.as_deref());
        if cipher.is_active() {
            info!("engine", "encryption at rest enabled");
        }
        let fs = FileSystem::mount(dev, cipher, opts.cache_capacity)?;
        info!("engine", "mounted {}", opts.device.display());
        Ok(Self {
            fs: Mutex::new(fs),
            opm: OpManager::new(),
        })
    }

    /// Commits all cached state and consumes the engine. A dirty mount
    /// that skips this is simply reloaded next time.
    pub fn unmount(self) -> CanFail<FsError> {
        if !self.opm.is_empty() {
            info!("engine", "unmounting with {} inodes still open", self.opm.len());
        }
        self.flush()?;
        info!("engine", "unmounted");
        Ok(())
    }

    /// Writes every cached inode and dirty block back to the device.
    pub fn flush(&self) -> CanFail<FsError> {
        let cached = self.opm.snapshot();
        let mut fs = self.fs.lock();
        for (index, inode) in cached {
            fs.write_inode(index, &inode)?;
        }
        fs.flush()
    }

    /// Filesystem-wide counters.
    pub fn stats(&self) -> FsStats {
        let fs = self.fs.lock();
        let raw = fs.sb.raw();
        FsStats {
            blocks: raw.s_blocks_count,
            free_blocks: raw.s_free_blocks_count,
            inodes: raw.s_inodes_count,
            free_inodes: raw.s_free_inodes_count,
        }
    }

    fn resolve(&self, path: &str) -> FsResult<(u32, Inode)> {
        let path = Path::parse(path)?;
        self.fs.lock().inode_lookup(path.components())
    }

    /// Applies `f` to the inode `index`: through the shared cache when one
    /// is live, directly against the table slot otherwise.
    fn with_inode_mut<R>(&self, index: u32, f: impl FnOnce(&mut Inode) -> R) -> FsResult<R> {
        if let Some(cache) = self.opm.existing(index) {
            let mut guard = cache.inode().write();
            return Ok(f(&mut guard));
        }
        let mut fs = self.fs.lock();
        let mut inode = fs.read_inode(index)?;
        let out = f(&mut inode);
        fs.write_inode(index, &inode)?;
        Ok(out)
    }

    /// Commits the final inode copy once the last reference is gone, and
    /// reaps inodes whose link count dropped to zero while they were
    /// still open.
    fn finish_release(&self, index: u32) -> CanFail<FsError> {
        let Some(inode) = self.opm.rel_cache(index) else {
            return Ok(());
        };
        let mut fs = self.fs.lock();
        fs.write_inode(index, &inode)?;
        if inode.i_links_count == 0 {
            fs.inode_delete(index)?;
        }
        Ok(())
    }

    fn reap_if_unused(&self, index: u32, links: u16) -> CanFail<FsError> {
        if links != 0 || self.opm.existing(index).is_some() {
            return Ok(());
        }
        match self.fs.lock().inode_delete(index) {
            // Lost the race against the last release; it already reaped.
            Err(FsError::NotFound) => Ok(()),
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Metadata operations
    // ------------------------------------------------------------------

    pub fn getattr(&self, path: &str) -> FsResult<FileStat> {
        let (index, _) = self.resolve(path)?;
        let cache = self.opm.get_cache(&self.fs, index)?;
        let stat = FileStat::new(index, &cache.inode().read());
        self.finish_release(index)?;
        Ok(stat)
    }

    pub fn mkdir(&self, path: &str, mode: u16) -> CanFail<FsError> {
        let path = Path::parse(path)?;
        let mode = S_IFDIR | (mode & !S_IFMT);
        let mut fs = self.fs.lock();
        let (_, created) = fs.inode_create(path.components(), mode)?;
        if !created {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> CanFail<FsError> {
        let path = Path::parse(path)?;
        let name = path.base().ok_or(FsError::Invalid)?;

        let mut fs = self.fs.lock();
        let (parent_index, mut parent) = fs.inode_lookup(path.parent())?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let loc = fs.scan_dir(&parent, name)?.ok_or(FsError::NotFound)?;
        let dir = fs.read_inode(loc.inode)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !fs.dir_is_empty(&dir)? {
            return Err(FsError::NotEmpty);
        }

        fs.tombstone(&loc)?;
        parent.i_mtime = now();
        fs.write_inode(parent_index, &parent)?;
        if let Some(pnode) = fs.dcache.resolve(path.parent()) {
            fs.dcache.remove(pnode, name);
        }
        fs.inode_delete(loc.inode)
    }

    /// Directory listing. `.` and `..` are synthesized; directories store
    /// neither.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = Path::parse(path)?;
        let mut fs = self.fs.lock();
        let (index, dir) = fs.inode_lookup(path.components())?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let parent_index = if path.is_root() {
            index
        } else {
            fs.inode_lookup(path.parent())?.0
        };

        let mut entries = vec![
            DirEntry {
                name: b".".to_vec(),
                inode: index,
                file_type: FILE_TYPE_DIR,
            },
            DirEntry {
                name: b"..".to_vec(),
                inode: parent_index,
                file_type: FILE_TYPE_DIR,
            },
        ];
        entries.extend(fs.dir_entries(&dir)?);
        Ok(entries)
    }

    pub fn link(&self, src: &str, dst: &str) -> CanFail<FsError> {
        let src = Path::parse(src)?;
        let dst = Path::parse(dst)?;
        let name = dst.base().ok_or(FsError::Invalid)?;

        let src_index = {
            let mut fs = self.fs.lock();
            let (src_index, src_inode) = fs.inode_lookup(src.components())?;
            if src_inode.is_dir() {
                return Err(FsError::IsDirectory);
            }
            let (parent_index, mut parent) = fs.inode_lookup(dst.parent())?;
            if !parent.is_dir() {
                return Err(FsError::NotADirectory);
            }
            if fs.scan_dir(&parent, name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }

            fs.dir_add_record(&mut parent, name, src_index, src_inode.file_type())?;
            parent.i_mtime = now();
            fs.write_inode(parent_index, &parent)?;
            src_index
        };

        self.with_inode_mut(src_index, |inode| {
            inode.i_links_count += 1;
            inode.i_ctime = now();
        })?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> CanFail<FsError> {
        let path = Path::parse(path)?;
        let name = path.base().ok_or(FsError::IsDirectory)?;

        let target = {
            let mut fs = self.fs.lock();
            let (parent_index, mut parent) = fs.inode_lookup(path.parent())?;
            if !parent.is_dir() {
                return Err(FsError::NotADirectory);
            }
            let loc = fs.scan_dir(&parent, name)?.ok_or(FsError::NotFound)?;
            if fs.read_inode(loc.inode)?.is_dir() {
                return Err(FsError::IsDirectory);
            }

            fs.tombstone(&loc)?;
            parent.i_mtime = now();
            fs.write_inode(parent_index, &parent)?;
            if let Some(pnode) = fs.dcache.resolve(path.parent()) {
                fs.dcache.remove(pnode, name);
            }
            loc.inode
        };

        let links = self.with_inode_mut(target, |inode| {
            inode.i_links_count = inode.i_links_count.saturating_sub(1);
            if inode.i_links_count == 0 {
                inode.i_dtime = now();
            }
            inode.i_links_count
        })?;
        self.reap_if_unused(target, links)
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> CanFail<FsError> {
        let path = Path::parse(linkpath)?;
        let bytes = target.as_bytes();
        if bytes.is_empty() || bytes.len() > BLOCK_SIZE {
            return Err(FsError::Invalid);
        }

        let mut fs = self.fs.lock();
        let (index, created) = fs.inode_create(path.components(), S_IFLNK | 0o777)?;
        if !created {
            return Err(FsError::AlreadyExists);
        }

        let mut inode = fs.read_inode(index)?;
        if bytes.len() <= INLINE_SYMLINK_MAX {
            let area: &mut [u8] = bytemuck::cast_slice_mut(&mut inode.i_block);
            area[..bytes.len()].copy_from_slice(bytes);
        } else {
            let (_, shared) = fs.append_block(&mut inode)?;
            shared.write().bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        }
        inode.i_size = bytes.len() as u32;
        fs.write_inode(index, &inode)
    }

    pub fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = Path::parse(path)?;
        let mut fs = self.fs.lock();
        let (_, inode) = fs.inode_lookup(path.components())?;
        if !inode.is_symlink() {
            return Err(FsError::Invalid);
        }

        let len = inode.i_size as usize;
        if inode.num_blocks() == 0 {
            let area: &[u8] = bytemuck::cast_slice(&inode.i_block);
            Ok(area[..len].to_vec())
        } else {
            let shared = fs.get_block(inode.i_block[0], false)?;
            let guard = shared.read();
            Ok(guard.bytes()[..len].to_vec())
        }
    }

    pub fn rename(&self, old: &str, new: &str, flags: u32) -> CanFail<FsError> {
        let old = Path::parse(old)?;
        let new = Path::parse(new)?;
        let old_name = old.base().ok_or(FsError::Invalid)?;
        let new_name = new.base().ok_or(FsError::Invalid)?;

        let mut replaced_file = None;
        {
            let mut fs = self.fs.lock();
            let (old_parent_index, old_parent) = fs.inode_lookup(old.parent())?;
            let loc = fs.scan_dir(&old_parent, old_name)?.ok_or(FsError::NotFound)?;
            let (new_parent_index, mut new_parent) = fs.inode_lookup(new.parent())?;
            if !new_parent.is_dir() {
                return Err(FsError::NotADirectory);
            }

            if let Some(dst) = fs.scan_dir(&new_parent, new_name)? {
                if flags & RENAME_NOREPLACE != 0 {
                    return Err(FsError::AlreadyExists);
                }
                if dst.inode == loc.inode {
                    return Ok(());
                }
                let dst_inode = fs.read_inode(dst.inode)?;
                if dst_inode.is_dir() {
                    if !fs.dir_is_empty(&dst_inode)? {
                        return Err(FsError::NotEmpty);
                    }
                    fs.tombstone(&dst)?;
                    fs.inode_delete(dst.inode)?;
                } else {
                    fs.tombstone(&dst)?;
                    replaced_file = Some(dst.inode);
                }
            }

            if new_parent_index == old_parent_index {
                fs.dir_add_record(&mut new_parent, new_name, loc.inode, loc.file_type)?;
                fs.tombstone(&loc)?;
                new_parent.i_mtime = now();
                fs.write_inode(new_parent_index, &new_parent)?;
            } else {
                let mut old_parent = old_parent;
                fs.dir_add_record(&mut new_parent, new_name, loc.inode, loc.file_type)?;
                fs.tombstone(&loc)?;
                let stamp = now();
                old_parent.i_mtime = stamp;
                new_parent.i_mtime = stamp;
                fs.write_inode(old_parent_index, &old_parent)?;
                fs.write_inode(new_parent_index, &new_parent)?;
            }

            if let Some(pnode) = fs.dcache.resolve(old.parent()) {
                fs.dcache.remove(pnode, old_name);
            }
            if let Some(pnode) = fs.dcache.resolve(new.parent()) {
                fs.dcache.remove(pnode, new_name);
            }
        }

        if let Some(index) = replaced_file {
            let links = self.with_inode_mut(index, |inode| {
                inode.i_links_count = inode.i_links_count.saturating_sub(1);
                if inode.i_links_count == 0 {
                    inode.i_dtime = now();
                }
                inode.i_links_count
            })?;
            self.reap_if_unused(index, links)?;
        }
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u16) -> CanFail<FsError> {
        let (index, _) = self.resolve(path)?;
        self.with_inode_mut(index, |inode| {
            inode.i_mode = (inode.i_mode & S_IFMT) | (mode & !S_IFMT);
            inode.i_ctime = now();
        })
    }

    pub fn chown(&self, path: &str, uid: Option<u16>, gid: Option<u16>) -> CanFail<FsError> {
        let (index, _) = self.resolve(path)?;
        self.with_inode_mut(index, |inode| {
            if let Some(uid) = uid {
                inode.i_uid = uid;
            }
            if let Some(gid) = gid {
                inode.i_gid = gid;
            }
            inode.i_ctime = now();
        })
    }

    pub fn utimens(&self, path: &str, atime: u32, mtime: u32) -> CanFail<FsError> {
        let (index, _) = self.resolve(path)?;
        self.with_inode_mut(index, |inode| {
            inode.i_atime = atime;
            inode.i_mtime = mtime;
            inode.i_ctime = now();
        })
    }

    /// Unix-mode check of `mask` (an `R_OK`/`W_OK`/`X_OK` combination)
    /// against the caller's credentials.
    pub fn access(&self, path: &str, mask: i32, uid: u16, gid: u16) -> CanFail<FsError> {
        let (_, inode) = self.resolve(path)?;
        if mask == 0 || uid == 0 {
            return Ok(());
        }
        let triad = if uid == inode.i_uid {
            (inode.i_mode >> 6) & 0o7
        } else if gid == inode.i_gid {
            (inode.i_mode >> 3) & 0o7
        } else {
            inode.i_mode & 0o7
        };
        if mask as u16 & !triad != 0 {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> CanFail<FsError> {
        if size > u32::MAX as u64 {
            return Err(FsError::Invalid);
        }
        let (index, inode) = self.resolve(path)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }

        if let Some(cache) = self.opm.existing(index) {
            let mut guard = cache.inode().write();
            let mut fs = self.fs.lock();
            Self::truncate_with(&mut fs, &mut guard, size)?;
            drop(fs);
            cache.upd_all();
        } else {
            let mut fs = self.fs.lock();
            let mut inode = fs.read_inode(index)?;
            Self::truncate_with(&mut fs, &mut inode, size)?;
            fs.write_inode(index, &inode)?;
        }
        Ok(())
    }

    fn truncate_with(fs: &mut FileSystem, inode: &mut Inode, size: u64) -> CanFail<FsError> {
        let old = inode.i_size as u64;
        if size < old {
            let keep = size.div_ceil(BS) as u32;
            fs.truncate_blocks(inode, keep)?;
            // Zero the dangling tail so a later grow reads as holes do.
            let tail = (size % BS) as usize;
            if tail != 0 && keep > 0 {
                if let Some(&last) = fs.inode_block_indices(inode)?.last() {
                    let shared = fs.get_block(last, true)?;
                    shared.write().bytes_mut()[tail..].fill(0);
                }
            }
        } else if size > old {
            let need = size.div_ceil(BS) as u32;
            while inode.num_blocks() < need {
                fs.append_block(inode)?;
            }
        }
        inode.i_size = size as u32;
        inode.i_mtime = now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handles and the data path
    // ------------------------------------------------------------------

    fn make_handle(&self, index: u32, flags: OpenFlags) -> FsResult<Handle> {
        let cache = self.opm.get_cache(&self.fs, index)?;
        let first_block = cache.inode().read().i_block[0];
        let handle = Arc::new(FileHandle {
            cache: cache.clone(),
            cursor: Mutex::new(Cursor {
                file_block: 0,
                block: first_block,
                ind: [0; 3],
            }),
            stale: AtomicBool::new(false),
            flags,
        });
        cache.attach(&handle);
        Ok(handle)
    }

    /// Creates a regular file and opens it read-write. An existing
    /// regular file at `path` is simply opened.
    pub fn create(&self, path: &str, mode: u16) -> FsResult<Handle> {
        let parsed = Path::parse(path)?;
        let mode = if mode & S_IFMT == 0 {
            S_IFREG | mode
        } else {
            mode
        };
        if mode & S_IFMT != S_IFREG {
            return Err(FsError::Invalid);
        }

        let index = {
            let mut fs = self.fs.lock();
            let (index, created) = fs.inode_create(parsed.components(), mode)?;
            if !created {
                let existing = fs.read_inode(index)?;
                if existing.is_dir() {
                    return Err(FsError::IsDirectory);
                }
                if !existing.is_regular() {
                    return Err(FsError::Invalid);
                }
            }
            index
        };
        self.make_handle(index, OpenFlags::read_write())
    }

    /// Opens an existing file with POSIX open(2) flag bits.
    pub fn open(&self, path: &str, flags: i32) -> FsResult<Handle> {
        let flags = OpenFlags::from_bits(flags)?;
        let (index, inode) = self.resolve(path)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.make_handle(index, flags)
    }

    /// Closes a handle. The last close of an inode commits its cached
    /// state and reaps it if it was unlinked while open.
    pub fn release(&self, handle: Handle) -> CanFail<FsError> {
        handle.cache.detach(&handle);
        let index = handle.inode_index();
        drop(handle);
        self.finish_release(index)
    }

    /// Flushes one file's data blocks and its inode to the device.
    pub fn fsync(&self, handle: &Handle) -> CanFail<FsError> {
        let inode = *handle.cache.inode().read();
        let mut fs = self.fs.lock();
        for index in fs.inode_block_indices(&inode)? {
            fs.flush_block(index)?;
        }
        fs.write_inode(handle.inode_index(), &inode)?;
        fs.dev.sync()
    }

    /// Reads up to `buf.len()` bytes at `offset`, clamped to the file
    /// size. Returns the number of bytes read.
    pub fn read(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if !handle.flags.readable() {
            return Err(FsError::Invalid);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut cursor = handle.cursor.lock();
        let inode = handle.cache.inode().read();
        if handle.take_stale() {
            let fb = cursor.file_block;
            self.bf_seek(&inode, &mut cursor, fb)?;
        }

        let size = inode.i_size as u64;
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;

        self.seek(&inode, &mut cursor, offset / BS)?;
        let at = (offset % BS) as usize;
        let first = (BLOCK_SIZE - at).min(want);
        self.copy_from_block(cursor.block, at, &mut buf[..first])?;

        let mut done = first;
        while done < want {
            self.next_block(&inode, &mut cursor)?;
            let csz = (want - done).min(BLOCK_SIZE);
            self.copy_from_block(cursor.block, 0, &mut buf[done..done + csz])?;
            done += csz;
        }
        Ok(want)
    }

    /// Writes `buf` at `offset` (at end-of-file for append handles).
    /// Returns the number of bytes written, which is short only when
    /// block allocation fails mid-write.
    pub fn write(&self, handle: &Handle, offset: u64, buf: &[u8]) -> FsResult<usize> {
        if !handle.flags.writable() {
            return Err(FsError::PermissionDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut cursor = handle.cursor.lock();

        // In-place writes only read the inode; take the shared lock so
        // they run concurrently with reads and each other.
        if !handle.flags.append {
            let inode = handle.cache.inode().read();
            if handle.take_stale() {
                let fb = cursor.file_block;
                self.bf_seek(&inode, &mut cursor, fb)?;
            }
            let size = inode.i_size as u64;
            if offset + buf.len() as u64 <= size {
                self.write_in_place(&inode, &mut cursor, offset, buf)?;
                drop(inode);
                handle.cache.inode().write().i_mtime = now();
                return Ok(buf.len());
            }
        }

        // The file grows: re-read the size under the exclusive lock.
        let mut inode = handle.cache.inode().write();
        if handle.take_stale() {
            let fb = cursor.file_block;
            self.bf_seek(&inode, &mut cursor, fb)?;
        }
        let size = inode.i_size as u64;
        let offset = if handle.flags.append { size } else { offset };
        if offset > size {
            return Err(FsError::Invalid);
        }
        if offset + buf.len() as u64 > u32::MAX as u64 {
            return Err(FsError::Invalid);
        }

        let mut written = 0;
        let mut pos = offset;
        while written < buf.len() {
            let file_block = pos / BS;
            if file_block < inode.num_blocks() as u64 {
                if written == 0 {
                    self.seek(&inode, &mut cursor, file_block)?;
                } else {
                    self.next_block(&inode, &mut cursor)?;
                }
            } else {
                let appended = self.fs.lock().append_block(&mut inode);
                match appended {
                    Ok((index, _)) => {
                        cursor.file_block = file_block;
                        cursor.block = index;
                    }
                    Err(_) if written > 0 => break,
                    Err(e) => return Err(e),
                }
            }

            let at = (pos % BS) as usize;
            let csz = (BLOCK_SIZE - at).min(buf.len() - written);
            self.copy_into_block(cursor.block, at, &buf[written..written + csz])?;
            written += csz;
            pos += csz as u64;
        }

        if pos > size {
            inode.i_size = pos as u32;
        }
        inode.i_mtime = now();
        drop(inode);

        // Sibling cursors (ours included) re-seek on their next call.
        handle.cache.upd_all();
        Ok(written)
    }

    fn write_in_place(
        &self,
        inode: &Inode,
        cursor: &mut Cursor,
        offset: u64,
        buf: &[u8],
    ) -> CanFail<FsError> {
        self.seek(inode, cursor, offset / BS)?;
        let at = (offset % BS) as usize;
        let first = (BLOCK_SIZE - at).min(buf.len());
        self.copy_into_block(cursor.block, at, &buf[..first])?;

        let mut done = first;
        while done < buf.len() {
            self.next_block(inode, cursor)?;
            let csz = (buf.len() - done).min(BLOCK_SIZE);
            self.copy_into_block(cursor.block, 0, &buf[done..done + csz])?;
            done += csz;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seek cursor over the block map
    // ------------------------------------------------------------------

    fn indirect(&self, block: u32, i: u32) -> FsResult<u32> {
        self.fs.lock().indirect_entry(block, i)
    }

    fn copy_from_block(&self, index: u32, at: usize, out: &mut [u8]) -> CanFail<FsError> {
        let mut fs = self.fs.lock();
        let shared = fs.get_block(index, false)?;
        let guard = shared.read();
        out.copy_from_slice(&guard.bytes()[at..at + out.len()]);
        Ok(())
    }

    fn copy_into_block(&self, index: u32, at: usize, data: &[u8]) -> CanFail<FsError> {
        let mut fs = self.fs.lock();
        let shared = fs.get_block(index, true)?;
        let mut guard = shared.write();
        guard.bytes_mut()[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Recomputes every indirection level of the cursor from `i_block`.
    fn bf_seek(&self, inode: &Inode, cursor: &mut Cursor, n: u64) -> CanFail<FsError> {
        cursor.file_block = n;
        if n < IND_START {
            cursor.block = inode.i_block[n as usize];
        } else if n < DIND_START {
            cursor.ind[0] = inode.i_block[12];
            cursor.block = self.indirect(cursor.ind[0], (n - IND_START) as u32)?;
        } else if n < TIND_START {
            let m = n - DIND_START;
            cursor.ind[0] = inode.i_block[13];
            cursor.ind[1] = self.indirect(cursor.ind[0], (m / NIND) as u32)?;
            cursor.block = self.indirect(cursor.ind[1], (m % NIND) as u32)?;
        } else if n < MAP_END {
            let m = n - TIND_START;
            cursor.ind[0] = inode.i_block[14];
            cursor.ind[1] = self.indirect(cursor.ind[0], (m / (NIND * NIND)) as u32)?;
            cursor.ind[2] = self.indirect(cursor.ind[1], ((m / NIND) % NIND) as u32)?;
            cursor.block = self.indirect(cursor.ind[2], (m % NIND) as u32)?;
        } else {
            return Err(FsError::Invalid);
        }
        Ok(())
    }

    /// Seeks to file block `n`, reusing the cached indirect chain when
    /// only the leaf level changes.
    fn seek(&self, inode: &Inode, cursor: &mut Cursor, n: u64) -> CanFail<FsError> {
        let old = cursor.file_block;
        if n == old {
            return Ok(());
        }

        if (IND_START..DIND_START).contains(&n) && (IND_START..DIND_START).contains(&old) {
            cursor.file_block = n;
            cursor.block = self.indirect(cursor.ind[0], (n - IND_START) as u32)?;
            return Ok(());
        }
        if (DIND_START..TIND_START).contains(&n) && (DIND_START..TIND_START).contains(&old) {
            let om = old - DIND_START;
            let nm = n - DIND_START;
            if om / NIND == nm / NIND {
                cursor.file_block = n;
                cursor.block = self.indirect(cursor.ind[1], (nm % NIND) as u32)?;
                return Ok(());
            }
        }
        if (TIND_START..MAP_END).contains(&n) && (TIND_START..MAP_END).contains(&old) {
            let om = old - TIND_START;
            let nm = n - TIND_START;
            if om / (NIND * NIND) == nm / (NIND * NIND) {
                cursor.file_block = n;
                if (om / NIND) % NIND != (nm / NIND) % NIND {
                    cursor.ind[2] = self.indirect(cursor.ind[1], ((nm / NIND) % NIND) as u32)?;
                }
                cursor.block = self.indirect(cursor.ind[2], (nm % NIND) as u32)?;
                return Ok(());
            }
        }

        self.bf_seek(inode, cursor, n)
    }

    /// Advances the cursor by one file block, re-seeking indirection
    /// levels only on boundary crossings.
    fn next_block(&self, inode: &Inode, cursor: &mut Cursor) -> CanFail<FsError> {
        let n = cursor.file_block + 1;
        if n < IND_START {
            cursor.block = inode.i_block[n as usize];
        } else if n == IND_START {
            cursor.ind[0] = inode.i_block[12];
            cursor.block = self.indirect(cursor.ind[0], 0)?;
        } else if n < DIND_START {
            cursor.block = self.indirect(cursor.ind[0], (n - IND_START) as u32)?;
        } else if n == DIND_START {
            cursor.ind[0] = inode.i_block[13];
            cursor.ind[1] = self.indirect(cursor.ind[0], 0)?;
            cursor.block = self.indirect(cursor.ind[1], 0)?;
        } else if n < TIND_START {
            let m = n - DIND_START;
            let (i1, i2) = ((m / NIND) as u32, (m % NIND) as u32);
            if i2 == 0 {
                cursor.ind[1] = self.indirect(cursor.ind[0], i1)?;
            }
            cursor.block = self.indirect(cursor.ind[1], i2)?;
        } else if n == TIND_START {
            cursor.ind[0] = inode.i_block[14];
            cursor.ind[1] = self.indirect(cursor.ind[0], 0)?;
            cursor.ind[2] = self.indirect(cursor.ind[1], 0)?;
            cursor.block = self.indirect(cursor.ind[2], 0)?;
        } else if n < MAP_END {
            let m = n - TIND_START;
            let i1 = (m / (NIND * NIND)) as u32;
            let i2 = ((m / NIND) % NIND) as u32;
            let i3 = (m % NIND) as u32;
            if i3 == 0 && i2 == 0 {
                cursor.ind[1] = self.indirect(cursor.ind[0], i1)?;
            }
            if i3 == 0 {
                cursor.ind[2] = self.indirect(cursor.ind[1], i2)?;
            }
            cursor.block = self.indirect(cursor.ind[2], i3)?;
        } else {
            return Err(FsError::Invalid);
        }
        cursor.file_block = n;
        Ok(())
    }
}
