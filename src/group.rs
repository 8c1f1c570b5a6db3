// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Assembles an Inventory stream into logical namespace groups and proves
//! each one is internally consistent and safely movable.
//!
//! Structural grouping (which records belong together) is written once,
//! generically over [`GroupMember`]; header cross-checks differ enough
//! between live segments and on-disk files (attach-and-read vs
//! open-and-`pread`) that backup and restore each get their own sanity
//! pass.

use crate::error::{Error, Result};
use crate::key::{DecodedKey, KeyClass, Role};
use crate::layout;
use crate::record::{FileRecord, GroupMember, SegmentRecord};
use crate::shm;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A structurally-or-header-invalid candidate group.
///
/// Fails only the one candidate group; the caller is free to move on to
/// the next requested namespace name.
#[derive(Debug)]
pub enum ValidationError {
    /// Neither a base/bound nor any orphan data stage was found for this
    /// namespace name.
    NoCandidate { namespace_name: String },
    /// Zero or more than one tree-index segment/file shares the base's
    /// instance and namespace-id.
    TreeIndexCount { namespace_name: String, found: usize },
    /// No primary stage exists at all.
    NoPrimaryStages { namespace_name: String },
    /// More than one meta segment/file shares the base's namespace-id.
    MetaCount { namespace_name: String, found: usize },
    /// A meta is present but no secondary stage backs it.
    NoSecondaryStages { namespace_name: String },
    /// Stage ordinals for `role` are not the contiguous set starting at
    /// `0x100`.
    NonContiguousStages {
        namespace_name: String,
        role: &'static str,
        ordinals: Vec<u16>,
    },
    /// Base version fell outside the configured compatibility window.
    VersionOutOfWindow {
        namespace_name: String,
        version: u32,
        window: (u32, u32),
    },
    /// Base shutdown-status was not `1` (backup only).
    UncleanShutdown { namespace_name: String, status: u32 },
    /// Declared arena count did not match the number of stages found.
    ArenaCountMismatch {
        namespace_name: String,
        role: &'static str,
        declared: u32,
        found: usize,
    },
    /// A file already on disk carries a key in this group's
    /// instance/namespace-id bucket (backup only).
    DestinationCollision { namespace_name: String, key: u32 },
    /// A live segment already exists with a key this group would create
    /// (restore only).
    SegmentCollision { namespace_name: String, key: u32 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidate { namespace_name } => {
                write!(f, "did not find any suitable segments or files for namespace {namespace_name:?}")
            }
            Self::TreeIndexCount { namespace_name, found } => write!(
                f,
                "namespace {namespace_name:?}: expected exactly one tree-index, found {found}"
            ),
            Self::NoPrimaryStages { namespace_name } => {
                write!(f, "namespace {namespace_name:?}: no primary stages found")
            }
            Self::MetaCount { namespace_name, found } => write!(
                f,
                "namespace {namespace_name:?}: expected zero or one meta, found {found}"
            ),
            Self::NoSecondaryStages { namespace_name } => write!(
                f,
                "namespace {namespace_name:?}: meta present but no secondary stages found"
            ),
            Self::NonContiguousStages { namespace_name, role, ordinals } => write!(
                f,
                "namespace {namespace_name:?}: {role} stage ordinals {ordinals:04x?} are not contiguous from 0x100"
            ),
            Self::VersionOutOfWindow { namespace_name, version, window } => write!(
                f,
                "namespace {namespace_name:?}: base version {version} outside compatibility window [{}, {}]",
                window.0, window.1
            ),
            Self::UncleanShutdown { namespace_name, status } => write!(
                f,
                "namespace {namespace_name:?}: expecting shutdown status 1, found {status}"
            ),
            Self::ArenaCountMismatch { namespace_name, role, declared, found } => write!(
                f,
                "namespace {namespace_name:?}: {role} declares {declared} arenas, found {found}"
            ),
            Self::DestinationCollision { namespace_name, key } => write!(
                f,
                "namespace {namespace_name:?}: destination already has a file for key {key:#010x}"
            ),
            Self::SegmentCollision { namespace_name, key } => write!(
                f,
                "namespace {namespace_name:?}: a shared-memory segment already exists for key {key:#010x}"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

fn select<'a, T: GroupMember>(
    records: &'a [T],
    instance: u8,
    namespace_id: u8,
    pred: impl Fn(&DecodedKey) -> bool,
) -> Vec<&'a T> {
    records
        .iter()
        .filter(|r| {
            let d = r.decoded();
            d.instance == instance && d.namespace_id == namespace_id && pred(d)
        })
        .collect()
}

fn check_contiguous(
    ordinals: &[u16],
    role: &'static str,
    namespace_name: &str,
) -> std::result::Result<(), ValidationError> {
    for (i, &o) in ordinals.iter().enumerate() {
        let expected = 0x100 + i as u16;
        if o != expected {
            return Err(ValidationError::NonContiguousStages {
                namespace_name: namespace_name.to_string(),
                role,
                ordinals: ordinals.to_vec(),
            });
        }
    }
    Ok(())
}

fn sorted_ordinals<T: GroupMember>(stages: &[T]) -> Vec<u16> {
    let mut ordinals: Vec<u16> = stages
        .iter()
        .filter_map(|s| s.decoded().stage_ordinal())
        .collect();
    ordinals.sort_unstable();
    ordinals
}

/// A validated group of live segments, ready for the Operation Driver.
#[derive(Debug)]
pub struct SegmentGroup {
    pub instance: u8,
    pub namespace_id: u8,
    pub namespace_name: String,
    pub base: Option<SegmentRecord>,
    pub tree_index: Option<SegmentRecord>,
    pub primary_stages: Vec<SegmentRecord>,
    pub meta: Option<SegmentRecord>,
    pub secondary_stages: Vec<SegmentRecord>,
    pub data_stages: Vec<SegmentRecord>,
}

/// A validated group of on-disk files, ready for the Operation Driver.
#[derive(Debug)]
pub struct FileGroup {
    pub instance: u8,
    pub namespace_id: Option<u8>,
    pub namespace_name: String,
    pub base: Option<FileRecord>,
    pub tree_index: Option<FileRecord>,
    pub primary_stages: Vec<FileRecord>,
    pub meta: Option<FileRecord>,
    pub secondary_stages: Vec<FileRecord>,
    pub data_stages: Vec<FileRecord>,
}

macro_rules! ordered_members_impl {
    ($self:ident) => {{
        let mut out = Vec::new();
        if let Some(b) = &$self.base {
            out.push(b);
        }
        if let Some(t) = &$self.tree_index {
            out.push(t);
        }
        out.extend($self.primary_stages.iter());
        if let Some(m) = &$self.meta {
            out.push(m);
        }
        out.extend($self.secondary_stages.iter());
        out.extend($self.data_stages.iter());
        out
    }};
}

impl SegmentGroup {
    /// Members in the fixed descriptor order the Operation Driver submits
    /// them in: `[base?, tree-index?, primary..., meta?, secondary..., data...]`.
    #[must_use]
    pub fn ordered_members(&self) -> Vec<&SegmentRecord> {
        ordered_members_impl!(self)
    }
}

impl FileGroup {
    #[must_use]
    pub fn ordered_members(&self) -> Vec<&FileRecord> {
        ordered_members_impl!(self)
    }
}

fn read_base_header_segment(shmid: i32, size: u64) -> std::io::Result<(u32, u32, u32)> {
    let attachment = shm::Attachment::attach_read_only(shmid, size as usize)?;
    let bytes = attachment.as_slice();
    Ok((
        read_u32_le(bytes, layout::BASE_VERSION_OFFSET),
        read_u32_le(bytes, layout::BASE_SHUTDOWN_STATUS_OFFSET),
        read_u32_le(bytes, layout::BASE_ARENA_COUNT_OFFSET),
    ))
}

fn read_meta_header_segment(shmid: i32, size: u64) -> std::io::Result<u32> {
    let attachment = shm::Attachment::attach_read_only(shmid, size as usize)?;
    Ok(read_u32_le(attachment.as_slice(), layout::META_ARENA_COUNT_OFFSET))
}

fn read_u32_le(bytes: &[u8], offset: u64) -> u32 {
    let start = offset as usize;
    let mut buf = [0u8; 4];
    let end = (start + 4).min(bytes.len());
    if start < end {
        buf[..end - start].copy_from_slice(&bytes[start..end]);
    }
    u32::from_le_bytes(buf)
}

fn read_base_header_file(path: &Path) -> std::io::Result<(u32, u32, u32)> {
    let file = std::fs::File::open(path)?;
    Ok((
        read_u32_at(&file, layout::BASE_VERSION_OFFSET)?,
        read_u32_at(&file, layout::BASE_SHUTDOWN_STATUS_OFFSET)?,
        read_u32_at(&file, layout::BASE_ARENA_COUNT_OFFSET)?,
    ))
}

fn read_meta_header_file(path: &Path) -> std::io::Result<u32> {
    let file = std::fs::File::open(path)?;
    read_u32_at(&file, layout::META_ARENA_COUNT_OFFSET)
}

fn read_u32_at(file: &std::fs::File, offset: u64) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    match file.read_exact_at(&mut buf, offset) {
        Ok(()) => Ok(u32::from_le_bytes(buf)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
        Err(e) => Err(e),
    }
}

/// Builds and validates a backup candidate group from live segments.
///
/// `existing_files` is the destination directory's current contents, used
/// for the collision check. A base whose attach-count is non-zero is
/// silently treated as absent, not as a validation failure.
pub fn build_segment_group(
    segments: &[SegmentRecord],
    existing_files: &[FileRecord],
    instance: u8,
    namespace_name: &str,
    version_window: (u32, u32),
) -> Result<SegmentGroup> {
    let base_candidates: Vec<&SegmentRecord> = segments
        .iter()
        .filter(|s| {
            s.decoded.instance == instance
                && matches!(s.decoded.role, Role::Base)
                && s.namespace_name.as_deref() == Some(namespace_name)
                && s.attach_count == 0
        })
        .collect();

    let base = match base_candidates.as_slice() {
        [] => return build_orphan_segment_group(segments, instance, namespace_name),
        [only] => (*only).clone(),
        _ => {
            return Err(ValidationError::NoCandidate {
                namespace_name: namespace_name.to_string(),
            }
            .into())
        }
    };

    let namespace_id = base.decoded.namespace_id;

    let tree_indices = select(segments, instance, namespace_id, |d| matches!(d.role, Role::TreeIndex));
    if tree_indices.len() != 1 {
        return Err(ValidationError::TreeIndexCount {
            namespace_name: namespace_name.to_string(),
            found: tree_indices.len(),
        }
        .into());
    }
    let tree_index = tree_indices[0].clone();

    let mut primary_stages: Vec<SegmentRecord> = select(segments, instance, namespace_id, |d| {
        matches!(d.class, KeyClass::Primary) && matches!(d.role, Role::Stage(_))
    })
    .into_iter()
    .cloned()
    .collect();
    if primary_stages.is_empty() {
        return Err(ValidationError::NoPrimaryStages {
            namespace_name: namespace_name.to_string(),
        }
        .into());
    }
    primary_stages.sort_by_key(|s| s.decoded.stage_ordinal().unwrap_or(0));
    check_contiguous(&sorted_ordinals(&primary_stages), "primary", namespace_name)?;

    let metas: Vec<&SegmentRecord> = select(segments, instance, namespace_id, |d| matches!(d.role, Role::Meta));
    if metas.len() > 1 {
        return Err(ValidationError::MetaCount {
            namespace_name: namespace_name.to_string(),
            found: metas.len(),
        }
        .into());
    }
    let meta = metas.first().map(|m| (*m).clone());

    let mut secondary_stages = Vec::new();
    if meta.is_some() {
        secondary_stages = select(segments, instance, namespace_id, |d| {
            matches!(d.class, KeyClass::Secondary) && matches!(d.role, Role::Stage(_))
        })
        .into_iter()
        .cloned()
        .collect();
        if secondary_stages.is_empty() {
            return Err(ValidationError::NoSecondaryStages {
                namespace_name: namespace_name.to_string(),
            }
            .into());
        }
        secondary_stages.sort_by_key(|s| s.decoded.stage_ordinal().unwrap_or(0));
        check_contiguous(&sorted_ordinals(&secondary_stages), "secondary", namespace_name)?;
    }

    let data_stages: Vec<SegmentRecord> = segments
        .iter()
        .filter(|s| {
            s.decoded.instance == instance
                && matches!(s.decoded.class, KeyClass::Data)
                && s.namespace_name.as_deref() == Some(namespace_name)
        })
        .cloned()
        .collect();

    let (version, shutdown_status, declared_primary) =
        read_base_header_segment(base.shmid, base.byte_size).map_err(Error::Io)?;

    if version < version_window.0 || version > version_window.1 {
        return Err(ValidationError::VersionOutOfWindow {
            namespace_name: namespace_name.to_string(),
            version,
            window: version_window,
        }
        .into());
    }
    if shutdown_status != layout::CLEAN_SHUTDOWN_STATUS {
        return Err(ValidationError::UncleanShutdown {
            namespace_name: namespace_name.to_string(),
            status: shutdown_status,
        }
        .into());
    }
    if declared_primary as usize != primary_stages.len() {
        return Err(ValidationError::ArenaCountMismatch {
            namespace_name: namespace_name.to_string(),
            role: "primary",
            declared: declared_primary,
            found: primary_stages.len(),
        }
        .into());
    }

    if let Some(meta) = &meta {
        let declared_secondary = read_meta_header_segment(meta.shmid, meta.byte_size).map_err(Error::Io)?;
        if declared_secondary as usize != secondary_stages.len() {
            return Err(ValidationError::ArenaCountMismatch {
                namespace_name: namespace_name.to_string(),
                role: "secondary",
                declared: declared_secondary,
                found: secondary_stages.len(),
            }
            .into());
        }
    }

    if let Some(colliding) = existing_files
        .iter()
        .find(|f| f.decoded.instance == instance && f.decoded.namespace_id == namespace_id)
    {
        return Err(ValidationError::DestinationCollision {
            namespace_name: namespace_name.to_string(),
            key: colliding.key,
        }
        .into());
    }

    Ok(SegmentGroup {
        instance,
        namespace_id,
        namespace_name: namespace_name.to_string(),
        base: Some(base),
        tree_index: Some(tree_index),
        primary_stages,
        meta,
        secondary_stages,
        data_stages,
    })
}

fn build_orphan_segment_group(
    segments: &[SegmentRecord],
    instance: u8,
    namespace_name: &str,
) -> Result<SegmentGroup> {
    let data_stages: Vec<SegmentRecord> = segments
        .iter()
        .filter(|s| {
            s.decoded.instance == instance
                && matches!(s.decoded.class, KeyClass::Data)
                && s.namespace_name.as_deref() == Some(namespace_name)
        })
        .cloned()
        .collect();

    if data_stages.is_empty() {
        return Err(ValidationError::NoCandidate {
            namespace_name: namespace_name.to_string(),
        }
        .into());
    }

    let namespace_id = data_stages[0].decoded.namespace_id;

    Ok(SegmentGroup {
        instance,
        namespace_id,
        namespace_name: namespace_name.to_string(),
        base: None,
        tree_index: None,
        primary_stages: Vec::new(),
        meta: None,
        secondary_stages: Vec::new(),
        data_stages,
    })
}

/// Builds and validates a restore candidate group from on-disk files.
///
/// `existing_segments` is the kernel's current segment table, used for the
/// collision check: no key this group would create may already exist.
pub fn build_file_group(
    files: &[FileRecord],
    existing_segments: &[SegmentRecord],
    instance: u8,
    namespace_name: &str,
    version_window: (u32, u32),
) -> Result<FileGroup> {
    let base_candidates: Vec<&FileRecord> = files
        .iter()
        .filter(|f| {
            f.decoded.instance == instance
                && matches!(f.decoded.role, Role::Base)
                && f.namespace_name.as_deref() == Some(namespace_name)
        })
        .collect();

    let base = match base_candidates.as_slice() {
        [] => return build_orphan_file_group(files, instance, namespace_name),
        [only] => (*only).clone(),
        _ => {
            return Err(ValidationError::NoCandidate {
                namespace_name: namespace_name.to_string(),
            }
            .into())
        }
    };

    let namespace_id = base.decoded.namespace_id;

    let tree_indices = select(files, instance, namespace_id, |d| matches!(d.role, Role::TreeIndex));
    if tree_indices.len() != 1 {
        return Err(ValidationError::TreeIndexCount {
            namespace_name: namespace_name.to_string(),
            found: tree_indices.len(),
        }
        .into());
    }
    let tree_index = tree_indices[0].clone();

    let mut primary_stages: Vec<FileRecord> = select(files, instance, namespace_id, |d| {
        matches!(d.class, KeyClass::Primary) && matches!(d.role, Role::Stage(_))
    })
    .into_iter()
    .cloned()
    .collect();
    if primary_stages.is_empty() {
        return Err(ValidationError::NoPrimaryStages {
            namespace_name: namespace_name.to_string(),
        }
        .into());
    }
    primary_stages.sort_by_key(|s| s.decoded.stage_ordinal().unwrap_or(0));
    check_contiguous(&sorted_ordinals(&primary_stages), "primary", namespace_name)?;

    let metas: Vec<&FileRecord> = select(files, instance, namespace_id, |d| matches!(d.role, Role::Meta));
    if metas.len() > 1 {
        return Err(ValidationError::MetaCount {
            namespace_name: namespace_name.to_string(),
            found: metas.len(),
        }
        .into());
    }
    let meta = metas.first().map(|m| (*m).clone());

    let mut secondary_stages = Vec::new();
    if meta.is_some() {
        secondary_stages = select(files, instance, namespace_id, |d| {
            matches!(d.class, KeyClass::Secondary) && matches!(d.role, Role::Stage(_))
        })
        .into_iter()
        .cloned()
        .collect();
        if secondary_stages.is_empty() {
            return Err(ValidationError::NoSecondaryStages {
                namespace_name: namespace_name.to_string(),
            }
            .into());
        }
        secondary_stages.sort_by_key(|s| s.decoded.stage_ordinal().unwrap_or(0));
        check_contiguous(&sorted_ordinals(&secondary_stages), "secondary", namespace_name)?;
    }

    let data_stages: Vec<FileRecord> = files
        .iter()
        .filter(|f| {
            f.decoded.instance == instance
                && matches!(f.decoded.class, KeyClass::Data)
                && f.namespace_name.as_deref() == Some(namespace_name)
        })
        .cloned()
        .collect();

    let (version, _shutdown_status, declared_primary) =
        read_base_header_file(&base.path).map_err(Error::Io)?;

    if version < version_window.0 || version > version_window.1 {
        return Err(ValidationError::VersionOutOfWindow {
            namespace_name: namespace_name.to_string(),
            version,
            window: version_window,
        }
        .into());
    }
    if declared_primary as usize != primary_stages.len() {
        return Err(ValidationError::ArenaCountMismatch {
            namespace_name: namespace_name.to_string(),
            role: "primary",
            declared: declared_primary,
            found: primary_stages.len(),
        }
        .into());
    }

    if let Some(meta) = &meta {
        let declared_secondary = read_meta_header_file(&meta.path).map_err(Error::Io)?;
        if declared_secondary as usize != secondary_stages.len() {
            return Err(ValidationError::ArenaCountMismatch {
                namespace_name: namespace_name.to_string(),
                role: "secondary",
                declared: declared_secondary,
                found: secondary_stages.len(),
            }
            .into());
        }
    }

    let group = FileGroup {
        instance,
        namespace_id: Some(namespace_id),
        namespace_name: namespace_name.to_string(),
        base: Some(base),
        tree_index: Some(tree_index),
        primary_stages,
        meta,
        secondary_stages,
        data_stages,
    };

    check_no_segment_collision(&group, existing_segments, namespace_name)?;
    Ok(group)
}

fn build_orphan_file_group(files: &[FileRecord], instance: u8, namespace_name: &str) -> Result<FileGroup> {
    let data_stages: Vec<FileRecord> = files
        .iter()
        .filter(|f| {
            f.decoded.instance == instance
                && matches!(f.decoded.class, KeyClass::Data)
                && f.namespace_name.as_deref() == Some(namespace_name)
        })
        .cloned()
        .collect();

    if data_stages.is_empty() {
        return Err(ValidationError::NoCandidate {
            namespace_name: namespace_name.to_string(),
        }
        .into());
    }

    let group = FileGroup {
        instance,
        namespace_id: data_stages.first().map(|d| d.decoded.namespace_id),
        namespace_name: namespace_name.to_string(),
        base: None,
        tree_index: None,
        primary_stages: Vec::new(),
        meta: None,
        secondary_stages: Vec::new(),
        data_stages,
    };

    Ok(group)
}

fn check_no_segment_collision(
    group: &FileGroup,
    existing_segments: &[SegmentRecord],
    namespace_name: &str,
) -> std::result::Result<(), ValidationError> {
    let group_keys: std::collections::HashSet<u32> = group.ordered_members().iter().map(|m| m.key).collect();
    if let Some(colliding) = existing_segments.iter().find(|s| group_keys.contains(&s.key)) {
        return Err(ValidationError::SegmentCollision {
            namespace_name: namespace_name.to_string(),
            key: colliding.key,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DecodedKey;

    fn seg(key: u32, decoded: DecodedKey, name: Option<&str>, attach_count: u64) -> SegmentRecord {
        SegmentRecord {
            key,
            shmid: key as i32,
            uid: 0,
            gid: 0,
            mode: 0o600,
            attach_count,
            byte_size: 4096,
            decoded,
            namespace_name: name.map(str::to_string),
            crc32: None,
        }
    }

    fn decoded(class: KeyClass, instance: u8, namespace_id: u8, role: Role) -> DecodedKey {
        DecodedKey { class, instance, namespace_id, role }
    }

    #[test]
    fn tree_index_count_rejects_missing() {
        let segments = vec![seg(
            0xAE00_1000,
            decoded(KeyClass::Primary, 0, 1, Role::Base),
            Some("foo"),
            0,
        )];
        let err = build_segment_group(&segments, &[], 0, "foo", (10, 12)).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::TreeIndexCount { .. })));
    }

    #[test]
    fn busy_base_falls_through_to_orphan_or_no_candidate() {
        let segments = vec![seg(
            0xAE00_1000,
            decoded(KeyClass::Primary, 0, 1, Role::Base),
            Some("foo"),
            1,
        )];
        let err = build_segment_group(&segments, &[], 0, "foo", (10, 12)).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NoCandidate { .. })));
    }

    #[test]
    fn non_contiguous_primary_stages_rejected() {
        let segments = vec![
            seg(0xAE00_1000, decoded(KeyClass::Primary, 0, 1, Role::Base), Some("foo"), 0),
            seg(0xAE00_1001, decoded(KeyClass::Primary, 0, 1, Role::TreeIndex), None, 0),
            seg(0xAE00_1100, decoded(KeyClass::Primary, 0, 1, Role::Stage(0x100)), None, 0),
            seg(0xAE00_1102, decoded(KeyClass::Primary, 0, 1, Role::Stage(0x102)), None, 0),
        ];
        let err = build_segment_group(&segments, &[], 0, "foo", (10, 12)).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NonContiguousStages { .. })));
    }

    #[test]
    fn orphan_data_group_without_base() {
        let segments = vec![seg(
            0xAD00_100C,
            decoded(KeyClass::Data, 0, 1, Role::Stage(0x00C)),
            Some("foo"),
            0,
        )];
        let group = build_segment_group(&segments, &[], 0, "foo", (10, 12)).unwrap();
        assert!(group.base.is_none());
        assert_eq!(group.data_stages.len(), 1);
    }

    #[test]
    fn no_candidate_when_nothing_matches() {
        let err = build_segment_group(&[], &[], 0, "foo", (10, 12)).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NoCandidate { .. })));
    }
}
