// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The two record shapes the Inventory produces: one per live shared-memory
//! segment, one per on-disk artifact.

use crate::key::DecodedKey;
use std::path::PathBuf;

/// One shared-memory segment, classified and (for base/data segments)
/// named.
#[derive(Clone, Debug)]
pub struct SegmentRecord {
    pub key: u32,
    pub shmid: i32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attach_count: u64,
    pub byte_size: u64,
    pub decoded: DecodedKey,
    pub namespace_name: Option<String>,
    pub crc32: Option<u32>,
}

/// One on-disk artifact (`<key>.dat` or `<key>.dat.gz`).
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub key: u32,
    pub path: PathBuf,
    /// Size of the file on disk (differs from `segment_size` when
    /// compressed).
    pub file_size: u64,
    /// Uncompressed size of the segment this file represents. Equal to
    /// `file_size` for raw files; read from the container header for
    /// compressed ones.
    pub segment_size: u64,
    pub compressed: bool,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub decoded: DecodedKey,
    pub namespace_name: Option<String>,
}

/// Common surface the Grouper needs from either record shape, so the
/// grouping algorithm (matching instance/namespace-id, sorting stage
/// ordinals) is written once.
pub trait GroupMember {
    fn key(&self) -> u32;
    fn decoded(&self) -> &DecodedKey;
    fn namespace_name(&self) -> Option<&str>;
}

impl GroupMember for SegmentRecord {
    fn key(&self) -> u32 {
        self.key
    }

    fn decoded(&self) -> &DecodedKey {
        &self.decoded
    }

    fn namespace_name(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }
}

impl GroupMember for FileRecord {
    fn key(&self) -> u32 {
        self.key
    }

    fn decoded(&self) -> &DecodedKey {
        &self.decoded
    }

    fn namespace_name(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }
}
