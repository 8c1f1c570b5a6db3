// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Moves a database server's System V shared-memory index segments to and
//! from files across a host reboot.
//!
//! A namespace's live segments form a fixed shape: one base, one tree-index,
//! a contiguous run of primary stages, an optional meta backed by a
//! contiguous run of secondary stages, and zero or more orphaned data
//! segments. [`inventory`] discovers candidates (from the kernel or from a
//! directory), [`group`] assembles and validates one namespace's shape, and
//! [`driver`] prepares descriptors, hands them to [`io`]'s worker pool, and
//! unwinds on failure. [`config::Options`] is the single point where
//! validated configuration enters the core; nothing below it reads argv or
//! the environment directly.
//!
//! ```no_run
//! use segsnap::config::{Mode, Options};
//! use segsnap::driver;
//!
//! let options = Options::new(Mode::Backup, "/var/dumps".into(), 0, ["db".to_string()], 4)
//!     .expect("valid options");
//! let summary = driver::run_namespace(&options, "db")?;
//! println!("moved {} segments, {} bytes", summary.members_moved, summary.bytes_transferred);
//! # Ok::<(), segsnap::error::Error>(())
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod group;
pub mod inventory;
pub mod io;
pub mod key;
pub mod layout;
pub mod record;
pub mod shm;

pub use config::{Mode, Options};
pub use error::{Error, Result};
