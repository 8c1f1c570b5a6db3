// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed byte offsets into segment/file bodies, and the compressed-file
//! container header.
//!
//! Every offset here is dictated by the target server's on-disk/in-memory
//! layout; none of it is ours to change.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Base segment/file: `u32` version, must lie within the configured
/// compatibility window.
pub const BASE_VERSION_OFFSET: u64 = 0;
/// Base segment/file: `u32` shutdown status, `1` means a clean shutdown.
pub const BASE_SHUTDOWN_STATUS_OFFSET: u64 = 4;
/// Base segment/file: namespace name, NUL-padded.
pub const BASE_NAMESPACE_NAME_OFFSET: u64 = 1024;
/// Base segment/file: declared primary-arena count.
pub const BASE_ARENA_COUNT_OFFSET: u64 = 2152;

/// Meta segment: declared secondary-arena count.
pub const META_ARENA_COUNT_OFFSET: u64 = 20;

/// Data segment/file: namespace name, NUL-padded.
pub const DATA_NAMESPACE_NAME_OFFSET: u64 = 12;

/// Width in bytes of every namespace-name field in the base/data layouts.
pub const NAMESPACE_NAME_LEN: usize = 32;

/// The shutdown status value that marks a clean shutdown.
pub const CLEAN_SHUTDOWN_STATUS: u32 = 1;

/// Chunk size used by every streaming I/O primitive (raw and compressed).
pub const IO_CHUNK_SIZE: usize = 1024 * 1024;

/// Bound on how much of a compressed data file is inflated just to recover
/// its embedded namespace name during file enumeration.
pub const NAME_SNIFF_INFLATE_BOUND: usize = 1024 * 1024;

/// Magic value this implementation writes.
pub const MAGIC_CURRENT: u32 = 0x544D_5341;
/// Magic value tolerated on read for compatibility with an old, swapped
/// byte-order writer (see DESIGN.md).
pub const MAGIC_LEGACY: u32 = 0x4153_4D54;

/// Container version; the only value this implementation understands.
pub const HEADER_VERSION: u32 = 1;

/// On-disk size of [`CompressedHeader`].
pub const COMPRESSED_HEADER_LEN: u64 = 20;

/// Fixed little-endian header written first in every compressed file,
/// followed immediately by a gzip stream covering the full segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompressedHeader {
    pub magic: u32,
    pub version: u32,
    pub segsz: u64,
    pub crc32: u32,
}

impl CompressedHeader {
    /// Builds the header this implementation writes for a segment of the
    /// given size and checksum.
    #[must_use]
    pub fn new(segsz: u64, crc32: u32) -> Self {
        Self {
            magic: MAGIC_CURRENT,
            version: HEADER_VERSION,
            segsz,
            crc32,
        }
    }

    /// Whether `magic` is one this implementation accepts on read.
    #[must_use]
    pub fn is_known_magic(magic: u32) -> bool {
        magic == MAGIC_CURRENT || magic == MAGIC_LEGACY
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.segsz)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            magic: r.read_u32::<LittleEndian>()?,
            version: r.read_u32::<LittleEndian>()?,
            segsz: r.read_u64::<LittleEndian>()?,
            crc32: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Trims a NUL-padded fixed-width byte field down to its logical string
/// contents (everything before the first NUL, lossily decoded).
#[must_use]
pub fn decode_padded_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = CompressedHeader::new(4096, 0xDEAD_BEEF);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), COMPRESSED_HEADER_LEN as usize);

        let read_back = CompressedHeader::read_from(&mut &buf[..]).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn accepts_both_magics() {
        assert!(CompressedHeader::is_known_magic(MAGIC_CURRENT));
        assert!(CompressedHeader::is_known_magic(MAGIC_LEGACY));
        assert!(!CompressedHeader::is_known_magic(0x1234_5678));
    }

    #[test]
    fn decodes_padded_name() {
        let mut raw = [0u8; NAMESPACE_NAME_LEN];
        raw[..3].copy_from_slice(b"foo");
        assert_eq!(decode_padded_name(&raw), "foo");
    }

    #[test]
    fn decodes_name_filling_whole_field() {
        let raw = [b'x'; NAMESPACE_NAME_LEN];
        assert_eq!(decode_padded_name(&raw), "x".repeat(NAMESPACE_NAME_LEN));
    }
}
