//! Error types shared across the storage engine.
//!
//! Every fallible engine operation returns a [`FsResult`]. The bridge layer
//! converts an [`FsError`] into the matching POSIX errno with
//! [`FsError::errno`] before handing it back to the kernel.

use core::fmt;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Result alias used by every fallible operation of the engine.
pub type FsResult<T> = Result<T, FsError>;

/// Error kinds raised by the storage engine.
///
/// The set is closed on purpose: the bridge maps each kind onto exactly one
/// errno, and nothing outside this enum ever crosses the engine boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// A path component or an inode is absent.
    NotFound,

    /// Device failure, or an on-disk structure contradicts a bitmap.
    IoError,

    /// Creating a name that already exists.
    AlreadyExists,

    /// An engine-internal invariant was broken.
    NullPtr,

    /// A non-directory was traversed as a path component.
    NotADirectory,

    /// A directory was used where only a file is allowed.
    IsDirectory,

    /// Malformed path, bad open flags, or an out-of-range offset.
    Invalid,

    /// A Unix-mode check against the caller's uid/gid failed.
    PermissionDenied,

    /// `rmdir` on a directory that still holds live entries.
    NotEmpty,

    /// The superblock authenticator did not decrypt to the expected value.
    AuthError,
}

impl FsError {
    /// Maps the error onto the POSIX errno reported to the bridge.
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::IoError => libc::EIO,
            Self::AlreadyExists => libc::EEXIST,
            Self::NullPtr => libc::EFAULT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Invalid => libc::EINVAL,
            Self::PermissionDenied => libc::EACCES,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::AuthError => libc::EACCES,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "no such file or directory",
            Self::IoError => "input/output error",
            Self::AlreadyExists => "file exists",
            Self::NullPtr => "internal invariant broken",
            Self::NotADirectory => "not a directory",
            Self::IsDirectory => "is a directory",
            Self::Invalid => "invalid argument",
            Self::PermissionDenied => "permission denied",
            Self::NotEmpty => "directory not empty",
            Self::AuthError => "authentication failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(_: std::io::Error) -> Self {
        Self::IoError
    }
}
