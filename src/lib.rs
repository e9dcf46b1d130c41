//! vaultfs, an encrypted ext2-style user-space filesystem storage engine.
//!
//! The crate owns the on-disk layout of a single-device, ext2-compatible
//! image: superblock and group descriptors, per-group bitmaps and inode
//! tables, direct and multi-level indirect block maps, and the packed
//! directory-record format. Around that sit the in-memory caches (a CLOCK
//! block cache, a dentry tree, per-inode handle caches) and a transparent
//! AES-256-CBC layer that encrypts every block on its way to the device.
//!
//! The public surface is the [`Engine`]: one owned value constructed by
//! [`Engine::mount`], exposing the handle-based operations a
//! kernel-to-user bridge dispatches syscalls onto, and torn down by
//! [`Engine::unmount`]. The offline [`check`] module validates an
//! unmounted image.
//!
//! ```no_run
//! use vaultfs::{Engine, MountOptions};
//!
//! let engine = Engine::mount(MountOptions::new("/tmp/disk").password("pw"))?;
//! let handle = engine.create("/hello", 0o644)?;
//! engine.write(&handle, 0, b"hello world")?;
//! engine.release(handle)?;
//! engine.unmount()?;
//! # Ok::<(), vaultfs::FsError>(())
//! ```

#[macro_use]
mod log;

mod cache;
mod crypto;
mod device;
mod fs;
mod handle;

pub mod check;
pub mod engine;
pub mod error;

pub use engine::{Engine, FileStat, FsStats, MountOptions, RENAME_NOREPLACE};
pub use error::{CanFail, FsError, FsResult};
pub use fs::dir::DirEntry;
pub use handle::{Access, FileHandle, Handle, OpenFlags};
