//! Raw device access.
//!
//! The engine talks to a single backing file through blocking, positioned
//! reads and writes. The file is opened with direct-I/O semantics when the
//! host filesystem supports them; offsets and lengths are always aligned to
//! [`DISK_ALIGN`], and every buffer that crosses this layer is at least
//! sector aligned in memory.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use crate::error::{CanFail, FsError, FsResult};

/// Alignment required for device offsets and transfer lengths, in bytes.
pub const DISK_ALIGN: usize = 512;

/// A blocking byte device backed by a regular file or a raw block device.
#[derive(Debug)]
pub struct Device {
    file: File,
}

impl Device {
    /// Opens the backing file at `path`, creating it if absent.
    ///
    /// The open is first attempted with `O_DIRECT | O_NOATIME`; filesystems
    /// that refuse direct I/O (tmpfs among others) get a plain open
    /// instead. The engine does not depend on the page cache being
    /// bypassed, only on positioned reads and writes.
    pub fn open(path: &Path) -> FsResult<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::Invalid)?;

        let flags = libc::O_RDWR | libc::O_CREAT | libc::O_DIRECT | libc::O_NOATIME;
        // Safety: `c_path` is a valid NUL-terminated string for the whole call.
        let mut fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644) };
        if fd < 0 {
            fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
        }
        if fd < 0 {
            error!("disk", "failed to open {}", path.display());
            return Err(FsError::IoError);
        }

        // Safety: `fd` is a freshly opened, owned descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self { file })
    }

    /// Reads `buf.len()` bytes at byte offset `offset`.
    ///
    /// Reads beyond the current end of the backing file zero-fill the rest
    /// of the buffer, so a freshly created sparse image reads as all
    /// zeroes.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<FsError> {
        debug_assert!(offset as usize % DISK_ALIGN == 0 && buf.len() % DISK_ALIGN == 0);

        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    buf[done..].fill(0);
                    return Ok(());
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    error!("disk", "read failed at {offset:#x} +{:#x}", buf.len());
                    return Err(FsError::IoError);
                }
            }
        }
        Ok(())
    }

    /// Writes `buf` at byte offset `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> CanFail<FsError> {
        debug_assert!(offset as usize % DISK_ALIGN == 0 && buf.len() % DISK_ALIGN == 0);

        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => return Err(FsError::IoError),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    error!("disk", "write failed at {offset:#x} +{:#x}", buf.len());
                    return Err(FsError::IoError);
                }
            }
        }
        Ok(())
    }

    /// Forces buffered writes of the backing file down to storage.
    pub fn sync(&self) -> CanFail<FsError> {
        self.file.sync_data().map_err(FsError::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("vaultfs-dev-{}-{name}", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[repr(C, align(512))]
    struct Sector([u8; 512]);

    #[test]
    fn read_past_eof_zero_fills() {
        let path = scratch("eof");
        let dev = Device::open(&path).unwrap();
        let mut buf = Sector([0xAA; 512]);
        dev.read_at(0, &mut buf.0).unwrap();
        assert!(buf.0.iter().all(|&b| b == 0));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_then_read_back() {
        let path = scratch("rw");
        let dev = Device::open(&path).unwrap();
        let data = Sector([0x5A; 512]);
        dev.write_at(1024, &data.0).unwrap();
        let mut back = Sector([0; 512]);
        dev.read_at(1024, &mut back.0).unwrap();
        assert_eq!(back.0, data.0);
        let _ = std::fs::remove_file(&path);
    }
}
