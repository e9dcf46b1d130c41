//! End-to-end scenarios against a scratch image file.

use std::path::PathBuf;

use vaultfs::{check, DirEntry, Engine, FsError, MountOptions, RENAME_NOREPLACE};

fn scratch(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("vaultfs-e2e-{}-{name}.img", std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

fn names(entries: &[DirEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| String::from_utf8_lossy(&e.name).into_owned())
        .collect()
}

#[test]
fn format_and_root() {
    let path = scratch("root");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let stat = engine.getattr("/").unwrap();
    assert_eq!(stat.mode & 0xf000, 0x4000);
    assert_eq!(stat.nlink, 1);
    assert_eq!(stat.size, 0);

    let entries = engine.readdir("/").unwrap();
    assert_eq!(names(&entries), vec![".", ".."]);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn write_12k_and_read_back() {
    let path = scratch("12k");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let data = vec![0x5Au8; 12288];
    let handle = engine.create("/a", 0o644).unwrap();
    assert_eq!(engine.write(&handle, 0, &data).unwrap(), 12288);
    engine.release(handle).unwrap();

    let handle = engine.open("/a", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; 12288];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), 12288);
    assert_eq!(back, data);
    engine.release(handle).unwrap();

    let stat = engine.getattr("/a").unwrap();
    assert_eq!(stat.size, 12288);
    assert_eq!(stat.blocks, 24);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn write_crosses_single_indirect() {
    let path = scratch("indirect");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let data: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let handle = engine.create("/b", 0o644).unwrap();
    assert_eq!(engine.write(&handle, 0, &data).unwrap(), data.len());

    // [48000, 52000) straddles the 11 -> 12 direct/indirect boundary.
    let mut slice = vec![0u8; 4000];
    assert_eq!(engine.read(&handle, 48000, &mut slice).unwrap(), 4000);
    assert_eq!(slice, data[48000..52000]);
    engine.release(handle).unwrap();

    // 16 data blocks; indirect blocks are not part of i_blocks.
    assert_eq!(engine.getattr("/b").unwrap().blocks, 128);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn write_crosses_double_indirect() {
    let path = scratch("dind");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    // 1040 blocks: past the 12 + 1024 boundary into the double-indirect
    // level, written in one call.
    let data: Vec<u8> = (0..1040 * 4096u32).map(|i| (i % 241) as u8).collect();
    let handle = engine.create("/big", 0o644).unwrap();
    assert_eq!(engine.write(&handle, 0, &data).unwrap(), data.len());

    let boundary = (12 + 1024) * 4096;
    let mut slice = vec![0u8; 8192];
    assert_eq!(
        engine.read(&handle, boundary as u64 - 4096, &mut slice).unwrap(),
        8192
    );
    assert_eq!(slice, data[boundary - 4096..boundary + 4096]);
    engine.release(handle).unwrap();

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn two_thousand_siblings() {
    let path = scratch("siblings");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    engine.mkdir("/dir", 0o755).unwrap();
    for i in 0..2000 {
        let handle = engine.create(&format!("/dir/f{i}"), 0o644).unwrap();
        engine.release(handle).unwrap();
    }

    let entries = engine.readdir("/dir").unwrap();
    assert_eq!(entries.len(), 2002);
    let got: std::collections::HashSet<String> = names(&entries).into_iter().collect();
    for i in 0..2000 {
        assert!(got.contains(&format!("f{i}")));
    }

    let stat = engine.getattr("/dir").unwrap();
    assert!(stat.size > 0 && stat.size % 4096 == 0);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn hardlink_survives_source_unlink() {
    let path = scratch("link");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let content = b"hardlink payload";
    let handle = engine.create("/x", 0o644).unwrap();
    engine.write(&handle, 0, content).unwrap();
    engine.release(handle).unwrap();

    engine.link("/x", "/y").unwrap();
    assert_eq!(engine.getattr("/x").unwrap().nlink, 2);

    engine.unlink("/x").unwrap();
    assert_eq!(engine.getattr("/x").unwrap_err(), FsError::NotFound);

    let handle = engine.open("/y", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; content.len()];
    engine.read(&handle, 0, &mut back).unwrap();
    assert_eq!(&back, content);
    engine.release(handle).unwrap();
    assert_eq!(engine.getattr("/y").unwrap().nlink, 1);

    // Linking a directory is refused.
    engine.mkdir("/d", 0o755).unwrap();
    assert_eq!(engine.link("/d", "/d2").unwrap_err(), FsError::IsDirectory);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn encrypted_mount_round_trip() {
    let path = scratch("crypt");
    let engine = Engine::mount(MountOptions::new(&path).password("pw")).unwrap();
    let handle = engine.create("/secret", 0o600).unwrap();
    engine.write(&handle, 0, b"HELLO").unwrap();
    engine.release(handle).unwrap();
    engine.unmount().unwrap();

    // The raw image must not contain the plaintext anywhere.
    let raw = std::fs::read(&path).unwrap();
    assert!(!raw.windows(5).any(|w| w == b"HELLO"));

    // Wrong password is refused at mount time.
    let err = Engine::mount(MountOptions::new(&path).password("wrong")).unwrap_err();
    assert_eq!(err, FsError::AuthError);
    let err = Engine::mount(MountOptions::new(&path)).unwrap_err();
    assert_eq!(err, FsError::AuthError);

    let engine = Engine::mount(MountOptions::new(&path).password("pw")).unwrap();
    let handle = engine.open("/secret", libc::O_RDONLY).unwrap();
    let mut back = [0u8; 5];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), 5);
    assert_eq!(&back, b"HELLO");
    engine.release(handle).unwrap();
    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn remount_preserves_everything() {
    let path = scratch("remount");
    let data: Vec<u8> = (0..30000u32).map(|i| (i % 199) as u8).collect();
    {
        let engine = Engine::mount(MountOptions::new(&path)).unwrap();
        engine.mkdir("/nested", 0o755).unwrap();
        let handle = engine.create("/nested/file", 0o644).unwrap();
        engine.write(&handle, 0, &data).unwrap();
        engine.release(handle).unwrap();
        engine.unmount().unwrap();
    }

    let engine = Engine::mount(MountOptions::new(&path)).unwrap();
    let handle = engine.open("/nested/file", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), data.len());
    assert_eq!(back, data);
    engine.release(handle).unwrap();
    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn rename_moves_and_replaces() {
    let path = scratch("rename");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let handle = engine.create("/old", 0o644).unwrap();
    engine.write(&handle, 0, b"renamed content").unwrap();
    engine.release(handle).unwrap();
    engine.mkdir("/sub", 0o755).unwrap();

    engine.rename("/old", "/sub/new", 0).unwrap();
    assert_eq!(engine.getattr("/old").unwrap_err(), FsError::NotFound);

    let handle = engine.open("/sub/new", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; 15];
    engine.read(&handle, 0, &mut back).unwrap();
    assert_eq!(&back, b"renamed content");
    engine.release(handle).unwrap();

    // NOREPLACE refuses an existing destination; plain rename replaces.
    let handle = engine.create("/other", 0o644).unwrap();
    engine.release(handle).unwrap();
    assert_eq!(
        engine
            .rename("/sub/new", "/other", RENAME_NOREPLACE)
            .unwrap_err(),
        FsError::AlreadyExists
    );
    engine.rename("/sub/new", "/other", 0).unwrap();
    assert_eq!(engine.getattr("/sub/new").unwrap_err(), FsError::NotFound);
    assert_eq!(engine.getattr("/other").unwrap().size, 15);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn truncate_shrinks_and_grows() {
    let path = scratch("trunc");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let data = vec![0xABu8; 10000];
    let handle = engine.create("/t", 0o644).unwrap();
    engine.write(&handle, 0, &data).unwrap();
    engine.release(handle).unwrap();

    engine.truncate("/t", 5000).unwrap();
    let stat = engine.getattr("/t").unwrap();
    assert_eq!(stat.size, 5000);
    assert_eq!(stat.blocks, 16);

    engine.truncate("/t", 9000).unwrap();
    let handle = engine.open("/t", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; 9000];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), 9000);
    assert!(back[..5000].iter().all(|&b| b == 0xAB));
    // The re-grown range reads as zeroes.
    assert!(back[5000..].iter().all(|&b| b == 0));
    engine.release(handle).unwrap();

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn symlink_round_trip() {
    let path = scratch("symlink");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    engine.symlink("/short", "/s1").unwrap();
    assert_eq!(engine.readlink("/s1").unwrap(), b"/short");
    assert_eq!(engine.getattr("/s1").unwrap().mode & 0xf000, 0xa000);

    // Past 60 bytes the target spills into a data block.
    let long = format!("/{}", "t".repeat(100));
    engine.symlink(&long, "/s2").unwrap();
    assert_eq!(engine.readlink("/s2").unwrap(), long.as_bytes());
    assert_eq!(engine.getattr("/s2").unwrap().size, long.len() as u64);

    assert_eq!(engine.readlink("/").unwrap_err(), FsError::Invalid);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn unlink_with_open_handle_defers_delete() {
    let path = scratch("defer");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let free_before = engine.stats().free_inodes;
    let handle = engine.create("/doomed", 0o644).unwrap();
    engine.write(&handle, 0, b"still readable").unwrap();

    engine.unlink("/doomed").unwrap();
    assert_eq!(engine.getattr("/doomed").unwrap_err(), FsError::NotFound);

    // The open handle keeps the inode and its data alive.
    let mut back = vec![0u8; 14];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), 14);
    assert_eq!(&back, b"still readable");

    // The last release reaps the inode and its blocks.
    engine.release(handle).unwrap();
    assert_eq!(engine.stats().free_inodes, free_before);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn append_handle_writes_at_eof() {
    let path = scratch("append");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let handle = engine.create("/log", 0o644).unwrap();
    engine.write(&handle, 0, b"one").unwrap();
    engine.release(handle).unwrap();

    let handle = engine
        .open("/log", libc::O_WRONLY | libc::O_APPEND)
        .unwrap();
    // The offset is ignored for append handles.
    engine.write(&handle, 0, b"two").unwrap();
    engine.release(handle).unwrap();

    let handle = engine.open("/log", libc::O_RDONLY).unwrap();
    let mut back = vec![0u8; 6];
    assert_eq!(engine.read(&handle, 0, &mut back).unwrap(), 6);
    assert_eq!(&back, b"onetwo");

    // Reads through a write-only handle are refused.
    let wo = engine.open("/log", libc::O_WRONLY).unwrap();
    assert!(engine.read(&wo, 0, &mut back).is_err());
    engine.release(wo).unwrap();
    engine.release(handle).unwrap();

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn sibling_handle_sees_growth() {
    let path = scratch("stale");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let writer = engine.create("/shared", 0o644).unwrap();
    engine.write(&writer, 0, &vec![1u8; 4096]).unwrap();

    let reader = engine.open("/shared", libc::O_RDONLY).unwrap();
    let mut one = vec![0u8; 16];
    engine.read(&reader, 0, &mut one).unwrap();
    assert!(one.iter().all(|&b| b == 1));

    // Growing through the writer stales the reader's cursor; its next
    // read re-seeks and sees the new region.
    engine.write(&writer, 4096, &vec![2u8; 8192]).unwrap();
    let mut two = vec![0u8; 16];
    assert_eq!(engine.read(&reader, 8192, &mut two).unwrap(), 16);
    assert!(two.iter().all(|&b| b == 2));

    engine.release(reader).unwrap();
    engine.release(writer).unwrap();
    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn rmdir_requires_empty() {
    let path = scratch("rmdir");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    engine.mkdir("/dir", 0o755).unwrap();
    let handle = engine.create("/dir/f", 0o644).unwrap();
    engine.release(handle).unwrap();

    assert_eq!(engine.rmdir("/dir").unwrap_err(), FsError::NotEmpty);
    assert_eq!(engine.rmdir("/dir/f").unwrap_err(), FsError::NotADirectory);
    assert_eq!(engine.unlink("/dir").unwrap_err(), FsError::IsDirectory);

    engine.unlink("/dir/f").unwrap();
    engine.rmdir("/dir").unwrap();
    assert_eq!(engine.getattr("/dir").unwrap_err(), FsError::NotFound);

    // The tombstoned parent entry stays gone after remount.
    engine.unmount().unwrap();
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();
    assert_eq!(engine.getattr("/dir").unwrap_err(), FsError::NotFound);
    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn access_checks_mode_triads() {
    let path = scratch("access");
    let engine = Engine::mount(MountOptions::new(&path)).unwrap();

    let handle = engine.create("/guarded", 0o640).unwrap();
    engine.release(handle).unwrap();
    engine.chown("/guarded", Some(100), Some(200)).unwrap();

    // Owner reads and writes, group only reads, others nothing.
    engine.access("/guarded", 6, 100, 1).unwrap();
    engine.access("/guarded", 4, 1, 200).unwrap();
    assert_eq!(
        engine.access("/guarded", 2, 1, 200).unwrap_err(),
        FsError::PermissionDenied
    );
    assert_eq!(
        engine.access("/guarded", 4, 1, 1).unwrap_err(),
        FsError::PermissionDenied
    );
    // Root bypasses the mode bits entirely.
    engine.access("/guarded", 7, 0, 0).unwrap();

    engine.chmod("/guarded", 0o644).unwrap();
    engine.access("/guarded", 4, 1, 1).unwrap();
    assert_eq!(engine.getattr("/guarded").unwrap().mode & 0o777, 0o644);

    engine.unmount().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn checker_accepts_exercised_image() {
    let path = scratch("checked");
    let opts = MountOptions::new(&path);
    let engine = Engine::mount(opts.clone()).unwrap();

    engine.mkdir("/a", 0o755).unwrap();
    engine.mkdir("/a/b", 0o755).unwrap();
    for i in 0..20 {
        let handle = engine.create(&format!("/a/b/f{i}"), 0o644).unwrap();
        engine.write(&handle, 0, &vec![i as u8; 5000]).unwrap();
        engine.release(handle).unwrap();
    }
    engine.unlink("/a/b/f3").unwrap();
    engine.symlink("/a/b/f4", "/lnk").unwrap();
    engine.unmount().unwrap();

    let report = check::check_image(&opts).unwrap();
    assert!(report.ok(), "violations: {:?}", report.errors);
    // root, /a, /a/b, 19 files, the symlink.
    assert_eq!(report.inodes_seen, 23);
    let _ = std::fs::remove_file(&path);
}
