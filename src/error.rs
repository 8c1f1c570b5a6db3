// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::group::ValidationError;
use crate::key::KeyError;

/// Errors that can occur while discovering, validating, or copying segments.
#[derive(Debug)]
pub enum Error {
    /// Bad CLI invocation or conflicting flags.
    Misuse(String),

    /// The host environment refused something the tool needs (directory
    /// inaccessible, the kernel's shared-memory table could not be read).
    Environment(std::io::Error),

    /// A candidate namespace group failed structural or header validation.
    ///
    /// This is a per-group failure: the caller may still proceed to the
    /// next requested namespace name.
    Validation(ValidationError),

    /// A segment key could not be decoded.
    Key(KeyError),

    /// I/O failed in a way the scheduler could not recover in-loop.
    Io(std::io::Error),

    /// A post-pass CRC32 did not match the value recorded during transfer.
    Integrity {
        /// The segment key this checksum belongs to.
        key: u32,
        /// The CRC32 recorded while the data was written or read.
        expected: u32,
        /// The CRC32 recomputed afterwards.
        got: u32,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Misuse(msg) => write!(f, "usage error: {msg}"),
            Self::Environment(e) => write!(f, "environment error: {e}"),
            Self::Validation(e) => write!(f, "validation error: {e}"),
            Self::Key(e) => write!(f, "key error: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Integrity { key, expected, got } => write!(
                f,
                "checksum mismatch for segment {key:#010x}: expected {expected:#010x}, got {got:#010x}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ValidationError> for Error {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<KeyError> for Error {
    fn from(value: KeyError) -> Self {
        Self::Key(value)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
