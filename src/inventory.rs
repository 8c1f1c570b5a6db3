// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Enumerates candidate segments (from the kernel) or candidate files
//! (from a directory), classifies each via [`crate::key`], filters by
//! instance and namespace name, and returns a key-ascending sequence.

use crate::error::{Error, Result};
use crate::key::{self, DecodedKey, Role};
use crate::layout;
use crate::record::{FileRecord, SegmentRecord};
use crate::shm;
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Enumerates every shared-memory segment belonging to `instance`,
/// restricting base/data segments to `namespace_filter` when given.
///
/// `namespace_filter` of `None` means "no name filter" (used by collision
/// checks, which need to see every live segment regardless of name).
/// Other roles (tree-index, meta, primary/secondary stages) are not
/// name-filterable (they carry no namespace name themselves) and are
/// returned whenever their instance matches; the Grouper reconciles them
/// against a base's namespace-id.
pub fn enumerate_segments(
    instance: u8,
    namespace_filter: Option<&[String]>,
    crc_check: bool,
) -> Result<Vec<SegmentRecord>> {
    let rows = shm::list_rows().map_err(Error::Environment)?;
    let wanted: Option<HashSet<&str>> =
        namespace_filter.map(|names| names.iter().map(String::as_str).collect());

    let mut records = Vec::new();
    for row in rows {
        let decoded = match key::decode(row.key) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if decoded.instance != instance {
            continue;
        }

        let record = match build_segment_record(&row, decoded, crc_check) {
            Ok(r) => r,
            Err(_) => continue,
        };

        if needs_namespace_name(&decoded) {
            if let Some(wanted) = &wanted {
                match &record.namespace_name {
                    Some(name) if wanted.contains(name.as_str()) => {}
                    _ => continue,
                }
            }
        }

        records.push(record);
    }

    records.sort_by_key(|r| r.key);
    Ok(records)
}

fn needs_namespace_name(decoded: &DecodedKey) -> bool {
    matches!(decoded.role, Role::Base) || matches!(decoded.class, key::KeyClass::Data)
}

fn build_segment_record(
    row: &shm::ProcShmRow,
    decoded: DecodedKey,
    crc_check: bool,
) -> std::io::Result<SegmentRecord> {
    let name_offset = name_offset_for(&decoded);

    let mut namespace_name = None;
    let mut crc32 = None;

    if name_offset.is_some() || crc_check {
        let attachment = shm::Attachment::attach_read_only(row.shmid, row.size as usize)?;
        let bytes = attachment.as_slice();

        if let Some(offset) = name_offset {
            let start = offset as usize;
            let end = (start + layout::NAMESPACE_NAME_LEN).min(bytes.len());
            if start <= bytes.len() {
                namespace_name = Some(layout::decode_padded_name(&bytes[start..end]));
            }
        }

        if crc_check {
            let mut hasher = crc32fast::Hasher::new();
            for chunk in bytes.chunks(layout::IO_CHUNK_SIZE) {
                hasher.update(chunk);
            }
            crc32 = Some(hasher.finalize());
        }
    }

    Ok(SegmentRecord {
        key: row.key,
        shmid: row.shmid,
        uid: row.uid,
        gid: row.gid,
        mode: row.mode,
        attach_count: row.nattch,
        byte_size: row.size,
        decoded,
        namespace_name,
        crc32,
    })
}

fn name_offset_for(decoded: &DecodedKey) -> Option<u64> {
    if matches!(decoded.role, Role::Base) {
        Some(layout::BASE_NAMESPACE_NAME_OFFSET)
    } else if matches!(decoded.class, key::KeyClass::Data) {
        Some(layout::DATA_NAMESPACE_NAME_OFFSET)
    } else {
        None
    }
}

/// Scans `dir` for `<8 hex digits>.dat[.gz]` files and classifies each.
pub fn enumerate_files(dir: &Path) -> Result<Vec<FileRecord>> {
    let entries = fs::read_dir(dir).map_err(Error::Environment)?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::Environment)?;
        let file_type = entry.file_type().map_err(Error::Environment)?;
        if !file_type.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        let Some((key, compressed)) = parse_file_name(file_name) else {
            continue;
        };

        let decoded = match key::decode(key) {
            Ok(d) => d,
            Err(_) => continue,
        };

        match build_file_record(&entry.path(), key, decoded, compressed) {
            Ok(record) => records.push(record),
            Err(_) => continue,
        }
    }

    records.sort_by_key(|r| r.key);
    Ok(records)
}

/// Parses `XXXXXXXX.dat` or `XXXXXXXX.dat.gz`, eight lower/upper-case hex
/// digits exactly.
fn parse_file_name(name: &str) -> Option<(u32, bool)> {
    let (stem, compressed) = if let Some(stem) = name.strip_suffix(".dat.gz") {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(".dat") {
        (stem, false)
    } else {
        return None;
    };

    if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let key = u32::from_str_radix(stem, 16).ok()?;
    Some((key, compressed))
}

fn build_file_record(
    path: &Path,
    key: u32,
    decoded: DecodedKey,
    compressed: bool,
) -> std::io::Result<FileRecord> {
    let perm = shm::perm_of_file(path)?;
    let file_size = fs::metadata(path)?.len();

    let mut file = fs::File::open(path)?;

    let segment_size = if compressed {
        let header = layout::CompressedHeader::read_from(&mut file)?;
        header.segsz
    } else {
        file_size
    };

    let namespace_name = if matches!(decoded.role, Role::Base) {
        Some(read_name_raw(&mut file, layout::BASE_NAMESPACE_NAME_OFFSET)?)
    } else if matches!(decoded.class, key::KeyClass::Data) {
        Some(if compressed {
            read_name_compressed(&mut file)?
        } else {
            read_name_raw(&mut file, layout::DATA_NAMESPACE_NAME_OFFSET)?
        })
    } else {
        None
    };

    Ok(FileRecord {
        key,
        path: path.to_path_buf(),
        file_size,
        segment_size,
        compressed,
        uid: perm.uid,
        gid: perm.gid,
        mode: perm.mode,
        decoded,
        namespace_name,
    })
}

fn read_name_raw(file: &mut fs::File, offset: u64) -> std::io::Result<String> {
    use std::os::unix::fs::FileExt;

    let mut buf = [0u8; layout::NAMESPACE_NAME_LEN];
    match file.read_exact_at(&mut buf, offset) {
        Ok(()) => Ok(layout::decode_padded_name(&buf)),
        // A file shorter than offset+len (shouldn't happen for a real
        // segment dump, but enumeration must not crash on a truncated
        // artifact) yields an empty name rather than an error.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Inflates only the leading [`layout::NAME_SNIFF_INFLATE_BOUND`] bytes of
/// a compressed data file to recover its embedded namespace name, without
/// paying for a full decompression pass.
fn read_name_compressed(file: &mut fs::File) -> std::io::Result<String> {
    use std::io::{Seek, SeekFrom};

    file.seek(SeekFrom::Start(layout::COMPRESSED_HEADER_LEN))?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let needed = layout::DATA_NAMESPACE_NAME_OFFSET as usize + layout::NAMESPACE_NAME_LEN;
    let mut prefix = vec![0u8; needed];
    let mut limited = (&mut decoder).take(layout::NAME_SNIFF_INFLATE_BOUND as u64);

    let mut filled = 0;
    while filled < needed {
        let n = limited.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < needed {
        return Ok(String::new());
    }

    let start = layout::DATA_NAMESPACE_NAME_OFFSET as usize;
    Ok(layout::decode_padded_name(&prefix[start..start + layout::NAMESPACE_NAME_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_file_name() {
        let (key, compressed) = parse_file_name("ae001000.dat").unwrap();
        assert_eq!(key, 0xAE00_1000);
        assert!(!compressed);
    }

    #[test]
    fn parses_compressed_file_name_case_insensitive() {
        let (key, compressed) = parse_file_name("AE001100.dat.gz").unwrap();
        assert_eq!(key, 0xAE00_1100);
        assert!(compressed);
    }

    #[test]
    fn rejects_wrong_digit_count() {
        assert!(parse_file_name("ae00100.dat").is_none());
        assert!(parse_file_name("ae0010000.dat").is_none());
    }

    #[test]
    fn rejects_non_hex_digits() {
        assert!(parse_file_name("zzzzzzzz.dat").is_none());
    }

    #[test]
    fn rejects_unrelated_extension() {
        assert!(parse_file_name("ae001000.txt").is_none());
    }

    #[test]
    fn enumerate_files_sorts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ae001100.dat", "ae001000.dat", "ae001001.dat"] {
            let path = dir.path().join(name);
            let mut buf = vec![0u8; 2200];
            buf[1024..1024 + 3].copy_from_slice(b"foo");
            fs::write(&path, buf).unwrap();
        }
        let records = enumerate_files(dir.path()).unwrap();
        let keys: Vec<u32> = records.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![0xAE00_1000, 0xAE00_1001, 0xAE00_1100]);
    }

    #[test]
    fn enumerate_files_ignores_non_matching_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), b"hi").unwrap();
        fs::write(dir.path().join("ae001000.dat"), vec![0u8; 2200]).unwrap();
        let records = enumerate_files(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn reads_base_namespace_name_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ae001000.dat");
        let mut buf = vec![0u8; 2200];
        buf[1024..1024 + 3].copy_from_slice(b"foo");
        fs::write(&path, buf).unwrap();

        let records = enumerate_files(dir.path()).unwrap();
        assert_eq!(records[0].namespace_name.as_deref(), Some("foo"));
    }
}
