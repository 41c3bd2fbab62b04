//! Advisory byte-range locks (`fcntl` record locks).
//!
//! The lock regions are plain offsets, decoupled from any data layout:
//! what matters is that every participant computes the same offset for the
//! same resource. Record locks are per-process, which is exactly the
//! granularity the worker model needs; they also evaporate when a worker
//! dies, so a killed worker can never wedge a row.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use crate::Result;

fn flock(kind: libc::c_short, offset: u64, len: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn set_lock(file: &File, fl: &libc::flock, wait: bool) -> io::Result<bool> {
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, fl) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            // Region already held elsewhere; only possible without wait.
            Some(libc::EACCES) | Some(libc::EAGAIN) if !wait => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Takes an exclusive lock, blocking until it is granted.
pub fn lock_exclusive(file: &File, offset: u64, len: u64) -> Result<()> {
    set_lock(file, &flock(libc::F_WRLCK as libc::c_short, offset, len), true)?;
    Ok(())
}

/// Tries an exclusive lock; `false` when another process holds the region.
pub fn try_lock_exclusive(file: &File, offset: u64, len: u64) -> Result<bool> {
    Ok(set_lock(
        file,
        &flock(libc::F_WRLCK as libc::c_short, offset, len),
        false,
    )?)
}

/// Takes a shared lock, blocking until it is granted.
pub fn lock_shared(file: &File, offset: u64, len: u64) -> Result<()> {
    set_lock(file, &flock(libc::F_RDLCK as libc::c_short, offset, len), true)?;
    Ok(())
}

/// Releases whatever this process holds on the region.
pub fn unlock(file: &File, offset: u64, len: u64) -> Result<()> {
    set_lock(file, &flock(libc::F_UNLCK as libc::c_short, offset, len), true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Record locks are per-process, so contention needs a second process.
    // These tests cover the single-process contract: re-locking the same
    // region succeeds, and unlock is idempotent.

    #[test]
    fn lock_cycle() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let file = f.as_file();
        lock_exclusive(file, 8, 1).unwrap();
        assert!(try_lock_exclusive(file, 8, 1).unwrap());
        unlock(file, 8, 1).unwrap();
        unlock(file, 8, 1).unwrap();
    }

    #[test]
    fn lock_past_eof_is_legal() {
        let f = tempfile::NamedTempFile::new().unwrap();
        // Row locks land far past the data; fcntl allows that.
        lock_exclusive(f.as_file(), 1 << 20, 1).unwrap();
        unlock(f.as_file(), 1 << 20, 1).unwrap();
    }

    #[test]
    fn shared_then_exclusive_upgrade() {
        let f = tempfile::NamedTempFile::new().unwrap();
        lock_shared(f.as_file(), 0, 4).unwrap();
        // Same process may upgrade.
        lock_exclusive(f.as_file(), 0, 4).unwrap();
        unlock(f.as_file(), 0, 4).unwrap();
    }
}
