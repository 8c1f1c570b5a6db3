// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Drives a full backup-then-restore cycle against real System V shared
//! memory segments.
//!
//! `segsnap::shm::list_rows` only ever reads `/proc/sysvipc/shm`, so this
//! needs a kernel that exposes it (true on stock Linux, not always true
//! inside a sandboxed container). Rather than fail there, the test exits
//! early.

use flate2::read::GzDecoder;
use segsnap::config::{Mode, Options};
use segsnap::key::{self, DecodedKey, KeyClass, Role};
use segsnap::layout;
use segsnap::shm;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use test_log::test;

const INSTANCE: u8 = 3;
const NAMESPACE_ID: u8 = 7;
const NAMESPACE: &str = "roundtrip";

fn sysvipc_available() -> bool {
    Path::new("/proc/sysvipc/shm").exists()
}

fn key_for(role: Role) -> u32 {
    key::encode(&DecodedKey {
        class: KeyClass::Primary,
        instance: INSTANCE,
        namespace_id: NAMESPACE_ID,
        role,
    })
}

/// Creates a brand-new segment, fills it via `fill`, and detaches. Returns
/// the key so the caller can look the segment back up later with a bare
/// `shmget`.
fn make_segment(role: Role, size: usize, fill: impl FnOnce(&mut [u8])) -> (u32, Vec<u8>) {
    let key = key_for(role);
    let shmid = shm::create_exclusive(key, size as u64, 0o600).expect("create segment");
    let mut attachment = shm::Attachment::attach_read_write(shmid, size).expect("attach segment");
    fill(attachment.as_mut_slice());
    let snapshot = attachment.as_slice().to_vec();
    (key, snapshot)
}

fn lookup_shmid(key: u32) -> i32 {
    // SAFETY: a bare lookup (size 0, no creation flags) against a key we
    // know already exists.
    let shmid = unsafe { libc::shmget(key as libc::c_int, 0, 0) };
    assert!(shmid >= 0, "segment for key {key:#010x} not found");
    shmid
}

fn write_base_header(buf: &mut [u8], version: u32, shutdown_status: u32, name: &str, primary_arena_count: u32) {
    buf[layout::BASE_VERSION_OFFSET as usize..][..4].copy_from_slice(&version.to_le_bytes());
    buf[layout::BASE_SHUTDOWN_STATUS_OFFSET as usize..][..4].copy_from_slice(&shutdown_status.to_le_bytes());
    let name_start = layout::BASE_NAMESPACE_NAME_OFFSET as usize;
    buf[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
    buf[layout::BASE_ARENA_COUNT_OFFSET as usize..][..4].copy_from_slice(&primary_arena_count.to_le_bytes());
}

fn read_back_file(path: &Path, compressed: bool) -> Vec<u8> {
    let mut file = std::fs::File::open(path).unwrap();
    if compressed {
        let header = layout::CompressedHeader::read_from(&mut file).unwrap();
        let mut decoder = GzDecoder::new(file);
        let mut out = Vec::with_capacity(header.segsz as usize);
        decoder.read_to_end(&mut out).unwrap();
        out
    } else {
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }
}

#[test]
fn backup_then_restore_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    if !sysvipc_available() {
        eprintln!("skipping: /proc/sysvipc/shm not present on this host");
        return Ok(());
    }

    const BASE_SIZE: usize = 4096;
    const TREE_SIZE: usize = 256;
    const STAGE_SIZE: usize = 8192;

    let (base_key, base_snapshot) = make_segment(Role::Base, BASE_SIZE, |buf| {
        write_base_header(buf, 11, layout::CLEAN_SHUTDOWN_STATUS, NAMESPACE, 1);
    });
    let (tree_key, tree_snapshot) = make_segment(Role::TreeIndex, TREE_SIZE, |buf| {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 0xFF) as u8;
        }
    });
    let (stage_key, stage_snapshot) = make_segment(Role::Stage(0x100), STAGE_SIZE, |buf| {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    });

    let original_base_shmid = lookup_shmid(base_key);
    let original_tree_shmid = lookup_shmid(tree_key);
    let original_stage_shmid = lookup_shmid(stage_key);

    let directory = tempfile::tempdir()?;

    let backup_options = Options::new(Mode::Backup, directory.path().to_path_buf(), INSTANCE, [NAMESPACE.to_string()], 2)?
        .with_crc_check(true)
        .with_gzip(true);

    let backup_summary = segsnap::driver::run_namespace(&backup_options, NAMESPACE)?;
    assert!(!backup_summary.analyzed);
    assert_eq!(backup_summary.members_moved, 3);

    let files = segsnap::inventory::enumerate_files(directory.path())?;
    let by_key: HashMap<u32, &segsnap::record::FileRecord> = files.iter().map(|f| (f.key, f)).collect();

    let base_file = by_key.get(&base_key).expect("base file written");
    assert!(!base_file.compressed, "base is never compressed");
    assert_eq!(read_back_file(&base_file.path, false), base_snapshot);

    let tree_file = by_key.get(&tree_key).expect("tree-index file written");
    assert!(tree_file.compressed, "tree-index is gzipped when gzip is requested");
    assert_eq!(read_back_file(&tree_file.path, true), tree_snapshot);

    let stage_file = by_key.get(&stage_key).expect("stage file written");
    assert!(stage_file.compressed);
    assert_eq!(read_back_file(&stage_file.path, true), stage_snapshot);

    // Simulate the reboot: the server's own segments go away, the backup
    // directory is all that is left.
    shm::remove(original_base_shmid)?;
    shm::remove(original_tree_shmid)?;
    shm::remove(original_stage_shmid)?;

    let restore_options = Options::new(Mode::Restore, directory.path().to_path_buf(), INSTANCE, [NAMESPACE.to_string()], 2)?
        .with_crc_check(true);

    let restore_summary = segsnap::driver::run_namespace(&restore_options, NAMESPACE)?;
    assert!(!restore_summary.analyzed);
    assert_eq!(restore_summary.members_moved, 3);

    let restored_base_shmid = lookup_shmid(base_key);
    let restored_tree_shmid = lookup_shmid(tree_key);
    let restored_stage_shmid = lookup_shmid(stage_key);

    let base_back = shm::Attachment::attach_read_only(restored_base_shmid, BASE_SIZE)?;
    assert_eq!(base_back.as_slice(), base_snapshot.as_slice());

    let tree_back = shm::Attachment::attach_read_only(restored_tree_shmid, TREE_SIZE)?;
    assert_eq!(tree_back.as_slice(), tree_snapshot.as_slice());

    let stage_back = shm::Attachment::attach_read_only(restored_stage_shmid, STAGE_SIZE)?;
    assert_eq!(stage_back.as_slice(), stage_snapshot.as_slice());

    drop(base_back);
    drop(tree_back);
    drop(stage_back);
    shm::remove(restored_base_shmid)?;
    shm::remove(restored_tree_shmid)?;
    shm::remove(restored_stage_shmid)?;

    Ok(())
}

#[test]
fn analyze_mode_performs_no_io() -> Result<(), Box<dyn std::error::Error>> {
    if !sysvipc_available() {
        eprintln!("skipping: /proc/sysvipc/shm not present on this host");
        return Ok(());
    }

    const NAME: &str = "analyzeonly";
    let namespace_id = NAMESPACE_ID + 1;

    let base_key = key::encode(&DecodedKey {
        class: KeyClass::Primary,
        instance: INSTANCE,
        namespace_id,
        role: Role::Base,
    });
    let tree_key = key::encode(&DecodedKey {
        class: KeyClass::Primary,
        instance: INSTANCE,
        namespace_id,
        role: Role::TreeIndex,
    });
    let stage_key = key::encode(&DecodedKey {
        class: KeyClass::Primary,
        instance: INSTANCE,
        namespace_id,
        role: Role::Stage(0x100),
    });

    let base_shmid = shm::create_exclusive(base_key, 4096, 0o600)?;
    {
        let mut attachment = shm::Attachment::attach_read_write(base_shmid, 4096)?;
        write_base_header(attachment.as_mut_slice(), 11, layout::CLEAN_SHUTDOWN_STATUS, NAME, 1);
    }
    let tree_shmid = shm::create_exclusive(tree_key, 256, 0o600)?;
    let stage_shmid = shm::create_exclusive(stage_key, 4096, 0o600)?;

    let directory = tempfile::tempdir()?;
    let options = Options::new(Mode::Backup, directory.path().to_path_buf(), INSTANCE, [NAME.to_string()], 1)?.analyze_only(true);

    let summary = segsnap::driver::run_namespace(&options, NAME)?;
    assert!(summary.analyzed);
    assert_eq!(summary.commands.len(), 3);
    assert!(std::fs::read_dir(directory.path())?.next().is_none(), "analyze mode must not write anything");

    shm::remove(base_shmid)?;
    shm::remove(tree_shmid)?;
    shm::remove(stage_shmid)?;

    Ok(())
}
