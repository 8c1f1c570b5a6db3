// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! For each validated namespace group, prepares I/O descriptors, submits
//! them to the Scheduler, cross-checks CRCs, and on any failure unwinds
//! every partially-created file or segment.
//!
//! Resource acquisition (an attached segment, an open file, a newly
//! created file, a newly created segment) is modeled as a scoped guard;
//! the two destructive guards ([`FileGuard`], [`SegmentGuard`]) default to
//! firing on drop and are disarmed only once the whole group succeeds.

use crate::config::{Mode, Options};
use crate::error::{Error, Result};
use crate::group;
use crate::inventory;
use crate::io::{self, Descriptor, IoKind, SchedulerReport};
use crate::key::Role;
use crate::layout;
use crate::record::{FileRecord, SegmentRecord};
use crate::shm;
use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Result of driving one namespace name through backup or restore.
#[derive(Debug)]
pub struct OperationSummary {
    pub namespace_name: String,
    /// True if this was an analyze-mode dry run; `commands` is populated
    /// and nothing else in this struct beyond `namespace_name` is
    /// meaningful.
    pub analyzed: bool,
    /// Shell-equivalent description of what would be done, analyze mode
    /// only.
    pub commands: Vec<String>,
    pub members_moved: usize,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

struct FileGuard {
    path: PathBuf,
    armed: bool,
}

impl FileGuard {
    fn armed(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

struct SegmentGuard {
    shmid: i32,
    armed: bool,
}

impl SegmentGuard {
    fn armed(shmid: i32) -> Self {
        Self { shmid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = shm::remove(self.shmid);
        }
    }
}

/// Drives one namespace name end-to-end: enumerate, group/validate,
/// (unless analyzing) transfer, cross-check, and commit or unwind.
pub fn run_namespace(options: &Options, name: &str) -> Result<OperationSummary> {
    let start = Instant::now();
    match options.mode {
        Mode::Backup => run_backup(options, name, start),
        Mode::Restore => run_restore(options, name, start),
    }
}

fn should_compress(gzip: bool, role: &Role) -> bool {
    gzip && !matches!(role, Role::Base | Role::Meta)
}

fn backup_file_name(key: u32, compressed: bool) -> String {
    if compressed {
        format!("{key:08x}.dat.gz")
    } else {
        format!("{key:08x}.dat")
    }
}

fn run_backup(options: &Options, name: &str, start: Instant) -> Result<OperationSummary> {
    let requested = [name.to_string()];
    let segments = inventory::enumerate_segments(options.instance, Some(&requested), options.crc_check)?;
    let existing_files = inventory::enumerate_files(&options.directory)?;
    let group = group::build_segment_group(
        &segments,
        &existing_files,
        options.instance,
        name,
        options.version_window,
    )?;

    let members = group.ordered_members();

    if options.analyze {
        let commands = members
            .iter()
            .map(|m| {
                let compressed = should_compress(options.gzip, &m.decoded.role);
                let path = options.directory.join(backup_file_name(m.key, compressed));
                format!("backup shmid={} key={:#010x} -> {}", m.shmid, m.key, path.display())
            })
            .collect();
        return Ok(OperationSummary {
            namespace_name: name.to_string(),
            analyzed: true,
            commands,
            members_moved: members.len(),
            bytes_transferred: 0,
            elapsed: start.elapsed(),
        });
    }

    let mut file_guards: Vec<FileGuard> = Vec::new();
    let mut prepared: Vec<(u32, PathBuf, bool)> = Vec::new();
    let mut descriptors: Vec<Descriptor> = Vec::new();

    for member in &members {
        let descriptor = prepare_backup_descriptor(
            member,
            &options.directory,
            options.gzip,
            options.crc_check,
            &mut file_guards,
        )?;
        let compressed = descriptor.kind == IoKind::CompressedWrite;
        let path = options.directory.join(backup_file_name(member.key, compressed));
        prepared.push((member.key, path, compressed));
        descriptors.push(descriptor);
    }

    let report = io::run(descriptors, options.thread_bound);
    if !report.ok {
        return Err(first_error(report, name));
    }

    if options.crc_check {
        verify_backup_crcs(&prepared, &report)?;
    }

    for guard in &mut file_guards {
        guard.disarm();
    }

    Ok(OperationSummary {
        namespace_name: name.to_string(),
        analyzed: false,
        commands: Vec::new(),
        members_moved: members.len(),
        bytes_transferred: report.total_transferred,
        elapsed: start.elapsed(),
    })
}

fn prepare_backup_descriptor(
    member: &SegmentRecord,
    dir: &Path,
    gzip: bool,
    crc_check: bool,
    file_guards: &mut Vec<FileGuard>,
) -> Result<Descriptor> {
    let compressed = should_compress(gzip, &member.decoded.role);
    let path = dir.join(backup_file_name(member.key, compressed));

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file_guards.push(FileGuard::armed(path));

    if !compressed {
        fallocate(&file, member.byte_size)?;
    }

    let segment = shm::Attachment::attach_read_only(member.shmid, member.byte_size as usize)?;

    Ok(Descriptor {
        key: member.key,
        kind: if compressed { IoKind::CompressedWrite } else { IoKind::RawWrite },
        shmid: member.shmid,
        file,
        segment,
        segment_size: member.byte_size,
        uid: member.uid,
        gid: member.gid,
        mode: member.mode,
        crc_check,
    })
}

fn fallocate(file: &std::fs::File, len: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid, open file descriptor for the duration of this call.
    let rc = unsafe { libc::posix_fallocate(fd, 0, len as libc::off_t) };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc).into());
    }
    Ok(())
}

fn recompute_file_crc(path: &Path, compressed: bool) -> Result<u32> {
    let file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; layout::IO_CHUNK_SIZE];

    if compressed {
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(layout::COMPRESSED_HEADER_LEN))?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    } else {
        let mut file = file;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(hasher.finalize())
}

fn recorded_crcs(report: &SchedulerReport) -> HashMap<u32, u32> {
    report
        .results
        .iter()
        .filter_map(|r| r.as_ref())
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|r| r.crc.map(|c| (r.key, c)))
        .collect()
}

fn verify_backup_crcs(prepared: &[(u32, PathBuf, bool)], report: &SchedulerReport) -> Result<()> {
    let recorded = recorded_crcs(report);
    for (key, path, compressed) in prepared {
        if let Some(&expected) = recorded.get(key) {
            let got = recompute_file_crc(path, *compressed)?;
            if got != expected {
                return Err(Error::Integrity { key: *key, expected, got });
            }
        }
    }
    Ok(())
}

fn run_restore(options: &Options, name: &str, start: Instant) -> Result<OperationSummary> {
    let files = inventory::enumerate_files(&options.directory)?;
    let existing_segments = inventory::enumerate_segments(options.instance, None, false)?;
    let group = group::build_file_group(
        &files,
        &existing_segments,
        options.instance,
        name,
        options.version_window,
    )?;

    let members = group.ordered_members();

    if options.analyze {
        let commands = members
            .iter()
            .map(|m| format!("restore key={:#010x} <- {}", m.key, m.path.display()))
            .collect();
        return Ok(OperationSummary {
            namespace_name: name.to_string(),
            analyzed: true,
            commands,
            members_moved: members.len(),
            bytes_transferred: 0,
            elapsed: start.elapsed(),
        });
    }

    let mut segment_guards: Vec<SegmentGuard> = Vec::new();
    let mut prepared: Vec<(u32, i32, u64)> = Vec::new();
    let mut descriptors: Vec<Descriptor> = Vec::new();

    for member in &members {
        let descriptor = prepare_restore_descriptor(member, options.crc_check, &mut segment_guards)?;
        prepared.push((descriptor.key, descriptor.shmid, descriptor.segment_size));
        descriptors.push(descriptor);
    }

    let report = io::run(descriptors, options.thread_bound);
    if !report.ok {
        return Err(first_error(report, name));
    }

    if options.crc_check {
        verify_restore_crcs(&prepared, &report)?;
    }

    for guard in &mut segment_guards {
        guard.disarm();
    }

    Ok(OperationSummary {
        namespace_name: name.to_string(),
        analyzed: false,
        commands: Vec::new(),
        members_moved: members.len(),
        bytes_transferred: report.total_transferred,
        elapsed: start.elapsed(),
    })
}

fn prepare_restore_descriptor(
    member: &FileRecord,
    crc_check: bool,
    segment_guards: &mut Vec<SegmentGuard>,
) -> Result<Descriptor> {
    let shmid = shm::create_exclusive(member.key, member.segment_size, member.mode)?;
    segment_guards.push(SegmentGuard::armed(shmid));

    let segment = shm::Attachment::attach_read_write(shmid, member.segment_size as usize)?;
    let file = std::fs::File::open(&member.path)?;

    Ok(Descriptor {
        key: member.key,
        kind: if member.compressed { IoKind::CompressedRead } else { IoKind::RawRead },
        shmid,
        file,
        segment,
        segment_size: member.segment_size,
        uid: member.uid,
        gid: member.gid,
        mode: member.mode,
        crc_check,
    })
}

fn verify_restore_crcs(prepared: &[(u32, i32, u64)], report: &SchedulerReport) -> Result<()> {
    let recorded = recorded_crcs(report);
    for (key, shmid, size) in prepared {
        if let Some(&expected) = recorded.get(key) {
            let attachment = shm::Attachment::attach_read_only(*shmid, *size as usize)?;
            let mut hasher = crc32fast::Hasher::new();
            for chunk in attachment.as_slice().chunks(layout::IO_CHUNK_SIZE) {
                hasher.update(chunk);
            }
            let got = hasher.finalize();
            if got != expected {
                return Err(Error::Integrity { key: *key, expected, got });
            }
        }
    }
    Ok(())
}

fn first_error(report: SchedulerReport, namespace_name: &str) -> Error {
    for outcome in report.results {
        if let Some(Err(e)) = outcome {
            return e;
        }
    }
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("namespace {namespace_name:?}: transfer aborted before completing"),
    ))
}
