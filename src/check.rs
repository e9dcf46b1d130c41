//! Offline integrity checker.
//!
//! Validates an unmounted image: superblock geometry and authenticator,
//! group-descriptor placement, bitmap/counter consistency, and the
//! directory tree (reachability, valid inode types, block bits set for
//! every referenced block, no cycles). Runs with exclusive access to the
//! image; diagnostics are collected into a [`CheckReport`].

use hashbrown::HashSet;

use crate::crypto::Cipher;
use crate::device::Device;
use crate::engine::MountOptions;
use crate::error::{FsError, FsResult};
use crate::fs::block::{Block, BLOCK_SIZE};
use crate::fs::dir::{FILE_TYPE_DIR, FILE_TYPE_REG, FILE_TYPE_SYMLINK};
use crate::fs::inode::{INODE_SIZE, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::fs::sb::{
    SuperBlock, AUTH_PLAINTEXT, BLOCKS_PER_GROUP, INODES_PER_GROUP, LOG_BLOCK_SIZE, ROOT_INODE,
    STATE_NORMAL, STATE_UNINIT, TOTAL_BLOCKS_PER_GROUP,
};
use crate::fs::FileSystem;

/// Directory nesting past which the tree walk assumes a cycle.
const MAX_DEPTH: usize = 4096;

/// Outcome of an offline check.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Human-readable violations, in discovery order.
    pub errors: Vec<String>,
    /// Inodes reached from the root.
    pub inodes_seen: usize,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, msg: String) {
        error!("check", "{msg}");
        self.errors.push(msg);
    }
}

fn check_range(report: &mut CheckReport, what: &str, val: u64, lo: u64, hi: u64) {
    if val < lo || val > hi {
        report.fail(format!("{what}: {val} violates the range [{lo}, {hi}]"));
    }
}

/// Runs the full offline traversal against the image named by `opts`.
///
/// The image must already be formatted; an `UNINIT` image fails
/// immediately. A wrong password surfaces as [`FsError::AuthError`].
pub fn check_image(opts: &MountOptions) -> FsResult<CheckReport> {
    let dev = Device::open(&opts.device)?;
    let cipher = Cipher::new(opts.password.as_deref());
    let mut report = CheckReport::default();

    let block0 = Block::load(&dev, &cipher, 0)?;
    let raw = *bytemuck::from_bytes::<crate::fs::sb::RawSuperblock>(&block0.bytes()[..128]);
    match raw.s_state {
        STATE_UNINIT => {
            report.fail("uninitialized filesystem".into());
            return Ok(report);
        }
        STATE_NORMAL => {}
        state => {
            report.fail(format!("unknown filesystem state {state}"));
            return Ok(report);
        }
    }
    if &raw.s_auth_string[..AUTH_PLAINTEXT.len()] != AUTH_PLAINTEXT {
        return Err(FsError::AuthError);
    }

    let block_size = 1u64
        .checked_shl(raw.s_log_block_size.saturating_add(10))
        .unwrap_or(0);
    info!("check", "block size: {block_size}");
    check_range(
        &mut report,
        "block size",
        block_size,
        BLOCK_SIZE as u64,
        BLOCK_SIZE as u64,
    );
    check_range(
        &mut report,
        "log block size",
        raw.s_log_block_size as u64,
        LOG_BLOCK_SIZE as u64,
        LOG_BLOCK_SIZE as u64,
    );
    check_range(
        &mut report,
        "blocks per group",
        raw.s_blocks_per_group as u64,
        TOTAL_BLOCKS_PER_GROUP as u64,
        TOTAL_BLOCKS_PER_GROUP as u64,
    );
    check_range(
        &mut report,
        "inodes per group",
        raw.s_inodes_per_group as u64,
        INODES_PER_GROUP as u64,
        INODES_PER_GROUP as u64,
    );
    check_range(
        &mut report,
        "inode size",
        raw.s_inode_size as u64,
        INODE_SIZE as u64,
        INODE_SIZE as u64,
    );
    check_range(
        &mut report,
        "first inode",
        raw.s_first_ino as u64,
        ROOT_INODE as u64,
        ROOT_INODE as u64,
    );
    check_range(&mut report, "group count", raw.s_group as u64, 1, 124);
    check_range(
        &mut report,
        "inode count",
        raw.s_inodes_count as u64,
        1,
        u32::MAX as u64,
    );
    if !report.ok() {
        return Ok(report);
    }

    drop(block0);
    let mut fs = FileSystem::mount(dev, cipher, opts.cache_capacity)?;
    check_groups(&mut fs, &mut report)?;
    check_tree(&mut fs, &mut report)?;

    if report.ok() {
        info!("check", "filesystem valid, {} inodes", report.inodes_seen);
    }
    Ok(report)
}

/// Per-group descriptor sanity: metadata regions in bounds and
/// non-overlapping, free counters consistent with the bitmaps.
fn check_groups(fs: &mut FileSystem, report: &mut CheckReport) -> FsResult<()> {
    let num_groups = fs.sb.num_groups();
    let mut regions: Vec<(u64, u64)> = Vec::new();
    let mut free_blocks_total = 0u64;
    let mut free_inodes_total = 0u64;

    for g in 0..num_groups {
        let desc = match fs.sb.group_desc(g) {
            Some(desc) => desc,
            None => {
                report.fail(format!("group {g}: descriptor missing"));
                continue;
            }
        };

        info!(
            "check",
            "group {g}: inode bitmap {:#x}, block bitmap {:#x}, inode table {:#x}",
            desc.bg_inode_bitmap,
            desc.bg_block_bitmap,
            desc.bg_inode_table
        );
        check_range(
            report,
            "free blocks count",
            desc.bg_free_blocks_count as u64,
            0,
            BLOCKS_PER_GROUP as u64,
        );
        check_range(
            report,
            "free inodes count",
            desc.bg_free_inodes_count as u64,
            0,
            INODES_PER_GROUP as u64,
        );

        regions.push((desc.bg_inode_bitmap as u64, BLOCK_SIZE as u64));
        regions.push((desc.bg_block_bitmap as u64, BLOCK_SIZE as u64));

        let grp = fs.group(g)?;
        let used_inodes = grp.used_inodes();
        let used_blocks = grp.used_blocks();
        if used_inodes + grp.desc().bg_free_inodes_count as u32 != INODES_PER_GROUP {
            report.fail(format!(
                "group {g}: inode bitmap has {used_inodes} bits set but {} marked free",
                grp.desc().bg_free_inodes_count
            ));
        }
        if used_blocks + grp.desc().bg_free_blocks_count as u32 != BLOCKS_PER_GROUP {
            report.fail(format!(
                "group {g}: block bitmap has {used_blocks} bits set but {} marked free",
                grp.desc().bg_free_blocks_count
            ));
        }
        free_blocks_total += grp.desc().bg_free_blocks_count as u64;
        free_inodes_total += grp.desc().bg_free_inodes_count as u64;
    }

    regions.sort_unstable();
    let mut last_end = 0;
    for (start, len) in regions {
        if start < last_end {
            report.fail(format!("bitmap region at {start:#x} overlaps its neighbor"));
        }
        last_end = start + len;
    }

    let raw = fs.sb.raw();
    if free_blocks_total != raw.s_free_blocks_count as u64 {
        report.fail(format!(
            "free block counts disagree: groups say {free_blocks_total}, superblock says {}",
            raw.s_free_blocks_count
        ));
    }
    if free_inodes_total != raw.s_free_inodes_count as u64 {
        report.fail(format!(
            "free inode counts disagree: groups say {free_inodes_total}, superblock says {}",
            raw.s_free_inodes_count
        ));
    }
    Ok(())
}

/// Depth-first walk of the directory tree from the root.
fn check_tree(fs: &mut FileSystem, report: &mut CheckReport) -> FsResult<()> {
    let mut seen = HashSet::new();
    walk(fs, report, &mut seen, ROOT_INODE, 0)?;
    report.inodes_seen = seen.len();
    Ok(())
}

fn walk(
    fs: &mut FileSystem,
    report: &mut CheckReport,
    seen: &mut HashSet<u32>,
    index: u32,
    depth: usize,
) -> FsResult<()> {
    if depth > MAX_DEPTH {
        report.fail(format!("directory nesting exceeds {MAX_DEPTH}, assuming a cycle"));
        return Ok(());
    }

    let inode = match fs.read_inode(index) {
        Ok(inode) => inode,
        Err(_) => {
            report.fail(format!("inode {index} is referenced but not allocated"));
            return Ok(());
        }
    };

    let kind = inode.i_mode & S_IFMT;
    if kind != S_IFDIR && kind != S_IFREG && kind != S_IFLNK {
        report.fail(format!("inode {index} has invalid type {kind:#x}"));
        return Ok(());
    }

    // A directory revisit is a cycle; a file revisit is a hardlink.
    if !seen.insert(index) {
        if kind == S_IFDIR {
            report.fail(format!("directory inode {index} reached twice"));
        }
        return Ok(());
    }

    // Every referenced data block must be marked allocated.
    for block in fs.inode_block_indices(&inode)? {
        let group = SuperBlock::block_group(block);
        let local = SuperBlock::block_local(block);
        if !fs.group(group)?.block_allocated(local) {
            report.fail(format!(
                "inode {index} references block {block} whose bitmap bit is clear"
            ));
        }
    }

    if kind != S_IFDIR {
        return Ok(());
    }
    for entry in fs.dir_entries(&inode)? {
        match entry.file_type {
            FILE_TYPE_DIR => walk(fs, report, seen, entry.inode, depth + 1)?,
            FILE_TYPE_REG | FILE_TYPE_SYMLINK => walk(fs, report, seen, entry.inode, depth)?,
            other => report.fail(format!(
                "inode {index}: record for inode {} has invalid file type {other:#x}",
                entry.inode
            )),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Engine;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("vaultfs-check-{}-{name}.img", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn fresh_image_passes() {
        let path = scratch("fresh");
        let opts = MountOptions::new(&path);
        let engine = Engine::mount(opts.clone()).unwrap();
        engine.mkdir("/dir", 0o755).unwrap();
        let handle = engine.create("/dir/file", 0o644).unwrap();
        engine.write(&handle, 0, b"payload").unwrap();
        engine.release(handle).unwrap();
        engine.unmount().unwrap();

        let report = check_image(&opts).unwrap();
        assert!(report.ok(), "violations: {:?}", report.errors);
        assert_eq!(report.inodes_seen, 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unformatted_image_fails() {
        let path = scratch("raw");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let report = check_image(&MountOptions::new(&path)).unwrap();
        assert!(!report.ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wrong_password_is_auth_error() {
        let path = scratch("pw");
        let engine = Engine::mount(MountOptions::new(&path).password("pw")).unwrap();
        engine.unmount().unwrap();

        let err = check_image(&MountOptions::new(&path).password("other")).unwrap_err();
        assert_eq!(err, FsError::AuthError);
        let _ = std::fs::remove_file(&path);
    }
}
