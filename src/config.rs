// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The validated, in-process configuration handed to the driver.
//!
//! The core never reads `std::env`, global CLI state, or the terminal
//! directly; every parameter it needs is a field on [`Options`] or an
//! explicit function argument. The CLI binary is the only thing that
//! constructs one of these from argv.

use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

/// Default compatibility window for the base segment/file version field.
pub const DEFAULT_VERSION_WINDOW: (u32, u32) = (10, 12);

/// Minimum and maximum accepted values for `-i`/instance.
pub const INSTANCE_RANGE: std::ops::RangeInclusive<u8> = 0..=15;

/// Minimum and maximum accepted values for `-t`/thread bound.
pub const THREAD_BOUND_RANGE: std::ops::RangeInclusive<usize> = 1..=1024;

/// Which direction an invocation moves segments.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Shared memory to files.
    Backup,
    /// Files to shared memory.
    Restore,
}

/// Validated configuration for one tool invocation, shared across every
/// requested namespace name.
#[derive(Clone, Debug)]
pub struct Options {
    pub mode: Mode,
    pub analyze: bool,
    pub crc_check: bool,
    /// Backup only; ignored for restore (compressed files are always
    /// auto-detected on read regardless of how they were written).
    pub gzip: bool,
    pub instance: u8,
    /// De-duplicated, non-empty namespace names, in request order.
    pub namespace_names: Vec<String>,
    pub directory: PathBuf,
    pub thread_bound: usize,
    pub verbose: bool,
    /// `[min, max]` inclusive window the base version field must fall in.
    pub version_window: (u32, u32),
}

/// Everything that can be wrong with a set of options before the driver
/// ever sees them. Distinct from [`crate::error::Error::Misuse`] only in
/// that it is produced by plain validation rather than argv parsing.
#[derive(Debug, Eq, PartialEq)]
pub enum OptionsError {
    NoNamespaceNames,
    InstanceOutOfRange(u8),
    ThreadBoundOutOfRange(usize),
    EmptyVersionWindow { min: u32, max: u32 },
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoNamespaceNames => write!(f, "no namespace names given (after de-duplication)"),
            Self::InstanceOutOfRange(i) => write!(f, "instance {i} out of range 0..=15"),
            Self::ThreadBoundOutOfRange(t) => write!(f, "thread bound {t} out of range 1..=1024"),
            Self::EmptyVersionWindow { min, max } => {
                write!(f, "version window [{min}, {max}] is empty")
            }
        }
    }
}

impl std::error::Error for OptionsError {}

impl Options {
    /// Builds an [`Options`] value, de-duplicating and stripping empty
    /// namespace names, and validating every bound.
    ///
    /// `names` may contain the empty string (silently skipped) and
    /// duplicates (kept once, in first-seen order).
    pub fn new(
        mode: Mode,
        directory: PathBuf,
        instance: u8,
        names: impl IntoIterator<Item = String>,
        thread_bound: usize,
    ) -> Result<Self, OptionsError> {
        if !INSTANCE_RANGE.contains(&instance) {
            return Err(OptionsError::InstanceOutOfRange(instance));
        }
        if !THREAD_BOUND_RANGE.contains(&thread_bound) {
            return Err(OptionsError::ThreadBoundOutOfRange(thread_bound));
        }

        let mut seen = std::collections::HashSet::new();
        let namespace_names: Vec<String> = names
            .into_iter()
            .filter(|name| !name.is_empty())
            .filter(|name| seen.insert(name.clone()))
            .collect();

        if namespace_names.is_empty() {
            return Err(OptionsError::NoNamespaceNames);
        }

        Ok(Self {
            mode,
            analyze: false,
            crc_check: false,
            gzip: false,
            instance,
            namespace_names,
            directory: absolute_path(directory),
            thread_bound,
            verbose: false,
            version_window: DEFAULT_VERSION_WINDOW,
        })
    }

    /// Sets a non-default version compatibility window, validating that it
    /// is not empty.
    pub fn with_version_window(mut self, window: (u32, u32)) -> Result<Self, OptionsError> {
        if window.0 > window.1 {
            return Err(OptionsError::EmptyVersionWindow {
                min: window.0,
                max: window.1,
            });
        }
        self.version_window = window;
        Ok(self)
    }

    #[must_use]
    pub fn analyze_only(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }

    #[must_use]
    pub fn with_crc_check(mut self, crc_check: bool) -> Self {
        self.crc_check = crc_check;
        self
    }

    #[must_use]
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    #[must_use]
    pub fn verbosely(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Absolutizes `path` without requiring it to exist (unlike
/// `fs::canonicalize`), so destination-directory comparisons and
/// analyze-mode output are stable regardless of the caller's cwd.
fn absolute_path<P: AsRef<Path>>(path: P) -> PathBuf {
    // NOTE: not sure this can even fail realistically; not much we can do
    // about it either way.
    #[allow(clippy::expect_used)]
    path.as_ref().absolutize().expect("should be absolute path").into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_and_skips_empty_names() {
        let opts = Options::new(
            Mode::Backup,
            PathBuf::from("/tmp"),
            0,
            ["foo".to_string(), "".to_string(), "foo".to_string(), "bar".to_string()],
            4,
        )
        .unwrap();
        assert_eq!(opts.namespace_names, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn rejects_all_empty_names() {
        let err = Options::new(Mode::Backup, PathBuf::from("/tmp"), 0, ["".to_string()], 4)
            .unwrap_err();
        assert_eq!(err, OptionsError::NoNamespaceNames);
    }

    #[test]
    fn rejects_instance_out_of_range() {
        let err = Options::new(Mode::Backup, PathBuf::from("/tmp"), 16, ["foo".to_string()], 4)
            .unwrap_err();
        assert_eq!(err, OptionsError::InstanceOutOfRange(16));
    }

    #[test]
    fn rejects_thread_bound_out_of_range() {
        let err = Options::new(Mode::Backup, PathBuf::from("/tmp"), 0, ["foo".to_string()], 0)
            .unwrap_err();
        assert_eq!(err, OptionsError::ThreadBoundOutOfRange(0));
    }

    #[test]
    fn rejects_inverted_version_window() {
        let opts = Options::new(Mode::Backup, PathBuf::from("/tmp"), 0, ["foo".to_string()], 4)
            .unwrap();
        let err = opts.with_version_window((12, 10)).unwrap_err();
        assert_eq!(err, OptionsError::EmptyVersionWindow { min: 12, max: 10 });
    }

    #[test]
    fn absolutizes_a_relative_directory() {
        let opts = Options::new(Mode::Backup, PathBuf::from("relative/dumps"), 0, ["foo".to_string()], 4)
            .unwrap();
        assert!(opts.directory.is_absolute());
        assert!(opts.directory.ends_with("relative/dumps"));
    }
}
