// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Thin, safe-at-the-boundary wrappers around System V shared memory.
//!
//! Enumeration reads the kernel's `/proc/sysvipc/shm` table rather than
//! scanning `shmctl(i, SHM_STAT, ...)` over an index range; the two are
//! observationally equivalent views of the same table (see DESIGN.md).

use std::ffi::c_void;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// One row of `/proc/sysvipc/shm`, the kernel's live segment table.
#[derive(Copy, Clone, Debug)]
pub struct ProcShmRow {
    pub key: u32,
    pub shmid: i32,
    pub mode: u32,
    pub size: u64,
    pub nattch: u64,
    pub uid: u32,
    pub gid: u32,
}

/// Path to the proc table; overridable only for tests, via
/// [`list_rows_from`].
const PROC_SYSVIPC_SHM: &str = "/proc/sysvipc/shm";

/// Lists every segment currently known to the kernel.
///
/// A malformed row is never fatal on its own (races against segments
/// appearing/disappearing mid-scan are normal); only an unreadable table
/// is an enumeration-level error.
pub fn list_rows() -> io::Result<Vec<ProcShmRow>> {
    list_rows_from(Path::new(PROC_SYSVIPC_SHM))
}

/// Same as [`list_rows`], reading from an arbitrary path (test seam).
pub fn list_rows_from(path: &Path) -> io::Result<Vec<ProcShmRow>> {
    let contents = fs::read_to_string(path)?;
    let mut rows = Vec::new();

    for line in contents.lines().skip(1) {
        if let Some(row) = parse_row(line) {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn parse_row(line: &str) -> Option<ProcShmRow> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // key shmid perms size cpid lpid nattch uid gid cuid cgid ...
    if fields.len() < 9 {
        return None;
    }

    let key = fields[0].parse::<i32>().ok()? as u32;
    let shmid = fields[1].parse::<i32>().ok()?;
    // `perms` is printed in octal (kernel format "%4o"), not decimal.
    let mode = u32::from_str_radix(fields[2], 8).ok()?;
    let size = fields[3].parse::<u64>().ok()?;
    let nattch = fields[6].parse::<u64>().ok()?;
    let uid = fields[7].parse::<u32>().ok()?;
    let gid = fields[8].parse::<u32>().ok()?;

    Some(ProcShmRow {
        key,
        shmid,
        mode,
        size,
        nattch,
        uid,
        gid,
    })
}

/// An attachment of one segment into this process's address space.
///
/// Detaches on drop along every exit path, including panics unwinding
/// through it, matching the "one `shmat` implies exactly one `shmdt`"
/// resource invariant.
pub struct Attachment {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: the attached region is exclusively owned by whichever descriptor
// holds this `Attachment`; our scheduling protocol guarantees only one
// worker thread ever touches a given descriptor at a time.
unsafe impl Send for Attachment {}

impl Attachment {
    /// Attaches `shmid` read-only.
    pub fn attach_read_only(shmid: i32, len: usize) -> io::Result<Self> {
        Self::attach(shmid, len, libc::SHM_RDONLY)
    }

    /// Attaches `shmid` read-write.
    pub fn attach_read_write(shmid: i32, len: usize) -> io::Result<Self> {
        Self::attach(shmid, len, 0)
    }

    fn attach(shmid: i32, len: usize, flags: i32) -> io::Result<Self> {
        // SAFETY: shmid is a kernel-assigned identifier we either just
        // enumerated or just created; std::ptr::null() lets the kernel
        // choose the address.
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), flags) };
        if addr == usize::MAX as *mut c_void {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    /// Borrows the attached region as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `addr` is a valid mapping of at least `len` bytes for the
        // lifetime of this `Attachment`.
        unsafe { std::slice::from_raw_parts(self.addr.cast::<u8>(), self.len) }
    }

    /// Borrows the attached region as a mutable byte slice.
    ///
    /// Callers must hold this attachment read-write (see
    /// [`Attachment::attach_read_write`]); writing through a read-only
    /// attachment is undefined behavior at the kernel level and will
    /// generally fault.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; exclusive access is guaranteed by `&mut
        // self`.
        unsafe { std::slice::from_raw_parts_mut(self.addr.cast::<u8>(), self.len) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // SAFETY: `addr` was returned by a successful `shmat` and has not
        // been detached yet.
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

/// Ownership and permission bits read back from (or about to be applied
/// to) a segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Perm {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// Creates a brand-new segment for `key`, failing if one already exists
/// (`IPC_CREAT | IPC_EXCL`).
pub fn create_exclusive(key: u32, size: u64, mode: u32) -> io::Result<i32> {
    // SAFETY: FFI call with plain integer arguments; no pointers involved.
    let shmid = unsafe {
        libc::shmget(
            key as i32,
            size as libc::size_t,
            libc::IPC_CREAT | libc::IPC_EXCL | (mode as i32 & 0o777),
        )
    };
    if shmid < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(shmid)
}

/// Applies `perm` (truncated to the low 9 mode bits) to an existing
/// segment via `shmctl(IPC_SET)`.
pub fn set_perm(shmid: i32, perm: Perm) -> io::Result<()> {
    // SAFETY: `ds` is zero-initialized then fully populated by an
    // `IPC_STAT` before we mutate and write it back; `shmctl` only reads
    // the fields it cares about for `IPC_SET`.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    ds.shm_perm.uid = perm.uid;
    ds.shm_perm.gid = perm.gid;
    ds.shm_perm.mode = (perm.mode & 0o777) as _;

    let rc = unsafe { libc::shmctl(shmid, libc::IPC_SET, &mut ds) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Destroys a segment (`shmctl(IPC_RMID)`). Used only for compensating
/// cleanup of segments this invocation itself created.
pub fn remove(shmid: i32) -> io::Result<()> {
    // SAFETY: IPC_RMID does not dereference the `buf` pointer; `null_mut`
    // is the documented idiom.
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads the owner/mode of a path already on disk, for propagating into a
/// restored file's destination segment.
pub fn perm_of_file(path: &Path) -> io::Result<Perm> {
    let meta = fs::metadata(path)?;
    Ok(Perm {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o777,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_row() {
        let row = parse_row("2923757584 6      600        4096       12345     12345     0          0     0     0     0          0          0          1700000000                  16384                  0").unwrap();
        assert_eq!(row.shmid, 6);
        assert_eq!(row.mode, 0o600);
        assert_eq!(row.size, 4096);
        assert_eq!(row.nattch, 0);
    }

    #[test]
    fn skips_short_rows() {
        assert!(parse_row("not enough fields").is_none());
    }

    #[test]
    fn parses_negative_key_as_bit_pattern() {
        // 0xAE001000 as i32 is negative; /proc prints it with %d.
        let key_i32: i32 = 0xAE00_1000u32 as i32;
        let line = format!("{key_i32} 7 600 4096 1 1 0 0 0 0 0 0 0 0 0 0");
        let row = parse_row(&line).unwrap();
        assert_eq!(row.key, 0xAE00_1000);
    }

    #[test]
    fn list_rows_from_skips_header_and_blank_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm");
        std::fs::write(&path, "key shmid perms size cpid lpid nattch uid gid cuid cgid atime dtime ctime rss swap\n").unwrap();
        let rows = list_rows_from(&path).unwrap();
        assert!(rows.is_empty());
    }
}
