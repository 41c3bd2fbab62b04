//! The active file: pid slots, heartbeat and shutdown flag.
//!
//! This record is the single-instance beacon. A starting supervisor that
//! finds an existing active file watches the heartbeat for one timeout;
//! if the counter advances, another instance is alive and startup is
//! refused. Sibling tools use the same observation to tell "supervisor
//! alive" from "stale file".

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::mapfile::MapFile;
use crate::status::ROLE_SLOTS;
use crate::{Result, StoreError};

/// File name inside the fifo directory.
pub const ACTIVE_FILE_NAME: &str = "ferry.active";

/// Pid slots: one per role plus the supervisor itself in slot 0.
pub const PID_SLOTS: usize = ROLE_SLOTS + 1;

const OFF_PIDS: usize = 0;
const OFF_HEARTBEAT: usize = PID_SLOTS * 4;
const OFF_SHUTDOWN: usize = OFF_HEARTBEAT + 4;
const OFF_SENTINEL: usize = OFF_SHUTDOWN + 1;
const ACTIVE_LEN: usize = OFF_SENTINEL + 1;

const SENTINEL: u8 = 0x04;

fn sample_heartbeat(path: &Path) -> Option<u32> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < ACTIVE_LEN || bytes[OFF_SENTINEL] != SENTINEL {
        return None;
    }
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[OFF_HEARTBEAT..OFF_HEARTBEAT + 4]);
    Some(u32::from_le_bytes(b))
}

/// Watches an existing active file for heartbeat movement.
pub fn heartbeat_advances(path: &Path, within: Duration) -> bool {
    let Some(first) = sample_heartbeat(path) else {
        return false;
    };
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
        match sample_heartbeat(path) {
            Some(now) if now != first => return true,
            Some(_) => continue,
            None => return false,
        }
    }
    false
}

/// Mapped active file handle.
pub struct ActiveFile {
    map: MapFile,
    path: PathBuf,
}

impl ActiveFile {
    /// Creates (or takes over) the active file, refusing when a live
    /// instance is detected.
    pub fn create(fifo_dir: &Path, takeover_wait: Duration) -> Result<Self> {
        let path = fifo_dir.join(ACTIVE_FILE_NAME);
        if path.exists() && heartbeat_advances(&path, takeover_wait) {
            return Err(StoreError::AlreadyRunning(path));
        }
        // Pre-size, truncate prior content, stamp the sentinel byte.
        let _ = std::fs::remove_file(&path);
        let mut map = MapFile::open(&path, ACTIVE_LEN as u64)?;
        map.bytes_mut().fill(0);
        map.put_u8(OFF_SENTINEL, SENTINEL);
        map.flush()?;
        Ok(ActiveFile { map, path })
    }

    /// Opens an existing active file (sibling tools, command senders).
    pub fn open(fifo_dir: &Path) -> Result<Self> {
        let path = fifo_dir.join(ACTIVE_FILE_NAME);
        if !path.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no active file",
            )));
        }
        let map = MapFile::open(&path, ACTIVE_LEN as u64)?;
        if map.get_u8(OFF_SENTINEL) != SENTINEL {
            return Err(StoreError::Corrupt {
                path,
                what: "missing sentinel byte",
            });
        }
        Ok(ActiveFile { map, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self, slot: usize) -> i32 {
        self.map.get_u32(OFF_PIDS + slot * 4) as i32
    }

    pub fn set_pid(&mut self, slot: usize, pid: i32) {
        self.map.put_u32(OFF_PIDS + slot * 4, pid as u32);
    }

    pub fn heartbeat(&self) -> u32 {
        self.map.get_u32(OFF_HEARTBEAT)
    }

    /// Advances the heartbeat by one. Called every supervisor loop turn.
    pub fn tick(&mut self) -> u32 {
        let next = self.map.get_u32(OFF_HEARTBEAT).wrapping_add(1);
        self.map.put_u32(OFF_HEARTBEAT, next);
        next
    }

    pub fn shutdown_requested(&self) -> bool {
        self.map.get_u8(OFF_SHUTDOWN) != 0
    }

    pub fn request_shutdown(&mut self) {
        self.map.put_u8(OFF_SHUTDOWN, 1);
    }

    /// Removes the file; final step of an orderly shutdown.
    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_use_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), Duration::from_millis(200)).unwrap();
        active.set_pid(0, 4242);
        active.set_pid(5, 777);
        assert_eq!(active.pid(0), 4242);
        assert_eq!(active.pid(5), 777);
        assert_eq!(active.heartbeat(), 0);
        assert_eq!(active.tick(), 1);
        assert!(!active.shutdown_requested());
        active.request_shutdown();
        assert!(active.shutdown_requested());
    }

    #[test]
    fn stale_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut first = ActiveFile::create(dir.path(), Duration::from_millis(100)).unwrap();
            first.set_pid(0, 1);
            first.map.flush().unwrap();
            // Dropped without unlink: simulates a crashed supervisor.
        }
        // No heartbeat movement, so takeover succeeds and state is fresh.
        let second = ActiveFile::create(dir.path(), Duration::from_millis(300)).unwrap();
        assert_eq!(second.pid(0), 0);
    }

    #[test]
    fn live_heartbeat_blocks_a_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ActiveFile::create(dir.path(), Duration::from_millis(100)).unwrap();

        let path = dir.path().join(ACTIVE_FILE_NAME);
        let ticker = std::thread::spawn(move || {
            for _ in 0..8 {
                first.tick();
                let _ = first.map.flush();
                std::thread::sleep(Duration::from_millis(50));
            }
            first
        });

        match ActiveFile::create(dir.path(), Duration::from_millis(300)) {
            Err(StoreError::AlreadyRunning(p)) => assert_eq!(p, path),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|a| a.heartbeat())),
        }
        let first = ticker.join().unwrap();
        first.unlink().unwrap();
    }

    #[test]
    fn sibling_observes_shutdown_flag() {
        let dir = tempfile::tempdir().unwrap();
        let active = ActiveFile::create(dir.path(), Duration::from_millis(100)).unwrap();
        let mut sibling = ActiveFile::open(dir.path()).unwrap();
        sibling.request_shutdown();
        assert!(active.shutdown_requested());
    }

    #[test]
    fn unlink_removes_the_beacon() {
        let dir = tempfile::tempdir().unwrap();
        let active = ActiveFile::create(dir.path(), Duration::from_millis(100)).unwrap();
        let path = active.path().to_path_buf();
        active.unlink().unwrap();
        assert!(!path.exists());
        assert!(ActiveFile::open(dir.path()).is_err());
    }
}
