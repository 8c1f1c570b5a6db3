// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The fixed-width worker pool that moves many segments concurrently
//! between shared memory and files.
//!
//! Workers are plain `std::thread::scope` threads, not an async runtime or
//! a thread-pool crate (see DESIGN.md): the workload is a handful of
//! blocking syscalls per descriptor, which is exactly what OS threads are
//! for.

use crate::error::{Error, Result};
use crate::layout;
use crate::shm;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

/// What a single descriptor does.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoKind {
    RawWrite,
    RawRead,
    CompressedWrite,
    CompressedRead,
}

/// Everything one worker needs to move one segment, fully prepared by the
/// Operation Driver before submission (source attached/destination
/// created, in both directions).
pub struct Descriptor {
    pub key: u32,
    pub kind: IoKind,
    pub shmid: i32,
    pub file: std::fs::File,
    pub segment: shm::Attachment,
    pub segment_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub crc_check: bool,
}

/// Outcome of one descriptor's transfer.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorResult {
    pub key: u32,
    pub bytes_transferred: u64,
    /// CRC32 recorded during the transfer, present only when the
    /// descriptor requested CRC checking. Compared by the Operation
    /// Driver against an independently-recomputed CRC after the whole
    /// group finishes.
    pub crc: Option<u32>,
}

/// Everything the Scheduler reports back once every worker has joined.
pub struct SchedulerReport {
    /// One outcome per submitted descriptor, in submission order. `None`
    /// means the descriptor was never claimed (the ok-flag had already
    /// gone false).
    pub results: Vec<Option<Result<DescriptorResult>>>,
    pub ok: bool,
    pub total_transferred: u64,
}

struct Shared {
    next_index: usize,
    ok: bool,
    total_transferred: u64,
    decile_reported: u8,
}

/// Runs `descriptors` to completion across `min(descriptors.len(),
/// max_parallelism, host_cpu_count)` worker threads.
///
/// The host CPU count is enforced here, not just as the CLI's default for
/// `max_parallelism`: an explicit `-t` above the host's core count must
/// still be capped.
///
/// Returns success (the report's `ok` field) iff every descriptor
/// completed without error and the ok-flag never flipped false. Never
/// retries a failed descriptor; compensating cleanup is the caller's job.
pub fn run(descriptors: Vec<Descriptor>, max_parallelism: usize) -> SchedulerReport {
    let n = descriptors.len();
    let bound = max_parallelism.min(num_cpus::get());
    let worker_count = bound.min(n.max(1)).max(1).min(n.max(1));
    let total_bytes: u64 = descriptors.iter().map(|d| d.segment_size).sum();

    let descriptors: Vec<Mutex<Descriptor>> = descriptors.into_iter().map(Mutex::new).collect();
    let results: Vec<Mutex<Option<Result<DescriptorResult>>>> =
        (0..n).map(|_| Mutex::new(None)).collect();
    let shared = Mutex::new(Shared {
        next_index: 0,
        ok: true,
        total_transferred: 0,
        decile_reported: 0,
    });

    if n == 0 {
        return SchedulerReport { results: Vec::new(), ok: true, total_transferred: 0 };
    }

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| worker_loop(&descriptors, &results, &shared, total_bytes));
        }
    });

    let shared = shared.into_inner().expect("scheduler mutex poisoned");
    let results = results
        .into_iter()
        .map(|m| m.into_inner().expect("result mutex poisoned"))
        .collect();

    SchedulerReport {
        results,
        ok: shared.ok,
        total_transferred: shared.total_transferred,
    }
}

fn worker_loop(
    descriptors: &[Mutex<Descriptor>],
    results: &[Mutex<Option<Result<DescriptorResult>>>],
    shared: &Mutex<Shared>,
    total_bytes: u64,
) {
    loop {
        let idx = {
            let mut guard = shared.lock().expect("scheduler mutex poisoned");
            if !guard.ok || guard.next_index >= descriptors.len() {
                return;
            }
            let idx = guard.next_index;
            guard.next_index += 1;
            idx
        };

        let outcome = {
            let mut desc = descriptors[idx].lock().expect("descriptor mutex poisoned");
            perform_io(&mut desc)
        };

        {
            let mut guard = shared.lock().expect("scheduler mutex poisoned");
            match &outcome {
                Ok(r) => {
                    guard.total_transferred += r.bytes_transferred;
                    report_progress(&mut guard, total_bytes);
                }
                Err(e) => {
                    guard.ok = false;
                    tracing::warn!(descriptor = idx, error = %e, "descriptor I/O failed");
                }
            }
        }

        *results[idx].lock().expect("result mutex poisoned") = Some(outcome);
    }
}

fn report_progress(shared: &mut Shared, total_bytes: u64) {
    if total_bytes == 0 {
        return;
    }
    let decile = ((shared.total_transferred.saturating_mul(10)) / total_bytes).min(10) as u8;
    if decile > shared.decile_reported {
        shared.decile_reported = decile;
        tracing::info!(
            percent = decile * 10,
            transferred = shared.total_transferred,
            total = total_bytes,
            "transfer progress"
        );
    }
}

fn perform_io(d: &mut Descriptor) -> Result<DescriptorResult> {
    match d.kind {
        IoKind::RawWrite => raw_write(d),
        IoKind::RawRead => raw_read(d),
        IoKind::CompressedWrite => compressed_write(d),
        IoKind::CompressedRead => compressed_read(d),
    }
}

fn apply_file_ownership(file: &std::fs::File, uid: u32, gid: u32, mode: u32) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is valid for the lifetime of `file`, which outlives this call.
    let rc = unsafe { libc::fchown(fd, uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fchmod(fd, mode as libc::mode_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn best_effort_fsync(file: &std::fs::File, key: u32) {
    if let Err(e) = file.sync_all() {
        tracing::warn!(key, error = %e, "fsync failed (best-effort, not propagated)");
    }
}

fn raw_write(d: &mut Descriptor) -> Result<DescriptorResult> {
    let mem = d.segment.as_slice();
    let mut hasher = d.crc_check.then(crc32fast::Hasher::new);
    let mut offset = 0u64;

    for chunk in mem.chunks(layout::IO_CHUNK_SIZE) {
        d.file.write_all_at(chunk, offset)?;
        if let Some(h) = hasher.as_mut() {
            h.update(chunk);
        }
        offset += chunk.len() as u64;
    }

    best_effort_fsync(&d.file, d.key);
    apply_file_ownership(&d.file, d.uid, d.gid, d.mode)?;

    Ok(DescriptorResult {
        key: d.key,
        bytes_transferred: offset,
        crc: hasher.map(crc32fast::Hasher::finalize),
    })
}

fn compressed_write(d: &mut Descriptor) -> Result<DescriptorResult> {
    d.file.write_all(&[0u8; layout::COMPRESSED_HEADER_LEN as usize])?;

    let mut hasher = crc32fast::Hasher::new();
    let mut transferred = 0u64;
    {
        let mut encoder = flate2::write::GzEncoder::new(&mut d.file, flate2::Compression::best_speed());
        let mem = d.segment.as_slice();
        for chunk in mem.chunks(layout::IO_CHUNK_SIZE) {
            encoder.write_all(chunk)?;
            hasher.update(chunk);
            transferred += chunk.len() as u64;
        }
        encoder.finish()?;
    }

    let crc = hasher.finalize();
    d.file.flush()?;
    best_effort_fsync(&d.file, d.key);

    d.file.seek(SeekFrom::Start(0))?;
    layout::CompressedHeader::new(d.segment_size, crc).write_to(&mut d.file)?;
    apply_file_ownership(&d.file, d.uid, d.gid, d.mode)?;

    Ok(DescriptorResult {
        key: d.key,
        bytes_transferred: transferred,
        crc: d.crc_check.then_some(crc),
    })
}

fn raw_read(d: &mut Descriptor) -> Result<DescriptorResult> {
    let segment_size = d.segment_size;
    let mut hasher = d.crc_check.then(crc32fast::Hasher::new);
    let mut offset = 0u64;
    let mut buf = vec![0u8; layout::IO_CHUNK_SIZE];

    while offset < segment_size {
        let want = ((segment_size - offset) as usize).min(buf.len());
        d.file.read_exact_at(&mut buf[..want], offset)?;

        let start = offset as usize;
        d.segment.as_mut_slice()[start..start + want].copy_from_slice(&buf[..want]);
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..want]);
        }
        offset += want as u64;
    }

    shm::set_perm(d.shmid, shm::Perm { uid: d.uid, gid: d.gid, mode: d.mode })?;

    Ok(DescriptorResult {
        key: d.key,
        bytes_transferred: offset,
        crc: hasher.map(crc32fast::Hasher::finalize),
    })
}

enum Wrapper {
    Gzip,
    Zlib,
}

fn detect_wrapper(file: &mut std::fs::File) -> std::io::Result<Wrapper> {
    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)?;
    file.seek(SeekFrom::Current(-2))?;
    if magic == [0x1f, 0x8b] {
        Ok(Wrapper::Gzip)
    } else {
        Ok(Wrapper::Zlib)
    }
}

fn stream_into_segment<R: Read>(
    reader: &mut R,
    segment: &mut shm::Attachment,
    target_len: usize,
    hasher: &mut Option<crc32fast::Hasher>,
) -> std::io::Result<usize> {
    let mem = segment.as_mut_slice();
    let mut filled = 0;
    while filled < target_len {
        let n = reader.read(&mut mem[filled..target_len])?;
        if n == 0 {
            break;
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&mem[filled..filled + n]);
        }
        filled += n;
    }
    Ok(filled)
}

fn compressed_read(d: &mut Descriptor) -> Result<DescriptorResult> {
    d.file.seek(SeekFrom::Start(0))?;
    let header = layout::CompressedHeader::read_from(&mut d.file)?;

    if !layout::CompressedHeader::is_known_magic(header.magic) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unrecognized compressed container magic {:#010x}", header.magic),
        )
        .into());
    }
    if header.version != layout::HEADER_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported container version {}", header.version),
        )
        .into());
    }
    if header.segsz != d.segment_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "container declares segsz {} but target segment is {} bytes",
                header.segsz, d.segment_size
            ),
        )
        .into());
    }

    let wrapper = detect_wrapper(&mut d.file)?;
    let mut hasher = d.crc_check.then(crc32fast::Hasher::new);
    let target_len = d.segment_size as usize;

    let transferred = match wrapper {
        Wrapper::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(&mut d.file);
            stream_into_segment(&mut decoder, &mut d.segment, target_len, &mut hasher)?
        }
        Wrapper::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(&mut d.file);
            stream_into_segment(&mut decoder, &mut d.segment, target_len, &mut hasher)?
        }
    };

    if transferred != target_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("decompressed {transferred} bytes, expected {target_len}"),
        )
        .into());
    }

    shm::set_perm(d.shmid, shm::Perm { uid: d.uid, gid: d.gid, mode: d.mode })?;

    Ok(DescriptorResult {
        key: d.key,
        bytes_transferred: transferred as u64,
        crc: hasher.map(crc32fast::Hasher::finalize),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_never_exceeds_descriptor_count() {
        // Pure arithmetic sanity check on the bound; exercising the real
        // scheduler needs live shm segments (see driver's integration
        // tests).
        let bound = |descs: usize, max: usize, cpus: usize| {
            max.min(cpus).min(descs.max(1)).max(1).min(descs.max(1))
        };
        assert_eq!(bound(3, 16, 32), 3);
        assert_eq!(bound(100, 4, 32), 4);
        assert_eq!(bound(0, 4, 32), 1);
        // An explicit -t above the host's core count is still capped.
        assert_eq!(bound(100, 1024, 8), 8);
    }
}
