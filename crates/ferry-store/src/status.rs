//! The supervisor's shared status record.
//!
//! One fixed-size record, mapped by the supervisor read-write and by
//! sibling tools read-only. The file name carries the record length in
//! hex, so a binary with a different layout never maps a stale file: on
//! mismatch a fresh record is created and old versions are deleted.

use std::path::Path;

use crate::mapfile::MapFile;
use crate::Result;

/// Number of supervised roles with a status byte in the record.
///
/// The role enumeration itself lives with the supervisor; only the slot
/// count is shared, because the record layout depends on it.
pub const ROLE_SLOTS: usize = 19;

/// Log-history rings: receive, system, transfer.
pub const LOG_HISTORY_TYPES: usize = 3;
pub const HISTORY_RECEIVE: usize = 0;
pub const HISTORY_SYSTEM: usize = 1;
pub const HISTORY_TRANSFER: usize = 2;
/// Buckets per ring, one byte each.
pub const LOG_HISTORY_LEN: usize = 48;

const MAGIC: u32 = 0x4154_5346; // "FSTA"

const OFF_MAGIC: usize = 0;
const OFF_LEN: usize = 4;
const OFF_ROLES: usize = 8; // ROLE_SLOTS bytes
const OFF_FORKS: usize = 28;
const OFF_BURSTS: usize = 32;
const OFF_DIR_SCANS: usize = 36;
const OFF_MAX_QUEUE: usize = 40;
const OFF_START_TIME: usize = 44;
const OFF_UID: usize = 52;
const OFF_HOSTNAME: usize = 56;
const HOSTNAME_LEN: usize = 64;
const OFF_HISTORY: usize = OFF_HOSTNAME + HOSTNAME_LEN; // 120

/// Total record length.
pub const STATUS_BLOCK_LEN: usize = OFF_HISTORY + LOG_HISTORY_TYPES * LOG_HISTORY_LEN; // 264

/// Status byte of one supervised role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RoleStatus {
    #[default]
    Off = 0,
    On = 1,
    Shutdown = 2,
    Stopped = 3,
    /// Not managed in this configuration.
    Neither = 4,
}

impl RoleStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => RoleStatus::On,
            2 => RoleStatus::Shutdown,
            3 => RoleStatus::Stopped,
            4 => RoleStatus::Neither,
            _ => RoleStatus::Off,
        }
    }
}

/// Writer handle over the mapped record.
pub struct StatusBlock {
    map: MapFile,
}

impl StatusBlock {
    /// The versioned file name for this build's layout.
    pub fn file_name() -> String {
        format!("ferry_status.{:x}", STATUS_BLOCK_LEN)
    }

    /// Maps the record in `fifo_dir`. Returns the block and whether it was
    /// created fresh (size or header mismatch discards prior epochs).
    pub fn attach(fifo_dir: &Path) -> Result<(Self, bool)> {
        let path = fifo_dir.join(Self::file_name());
        let existed = path.exists()
            && std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) == STATUS_BLOCK_LEN as u64;

        if !existed {
            // Sweep older layouts; they are meaningless to this build.
            if let Ok(entries) = std::fs::read_dir(fifo_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("ferry_status.") && name != Self::file_name() {
                        log::info!("removing stale status file {name}");
                        if let Err(e) = std::fs::remove_file(entry.path()) {
                            log::warn!("cannot remove stale status file {name}: {e}");
                        }
                    }
                }
            }
            let _ = std::fs::remove_file(&path);
        }

        let mut map = MapFile::open(&path, STATUS_BLOCK_LEN as u64)?;
        let fresh = !existed || map.get_u32(OFF_MAGIC) != MAGIC;
        if fresh {
            map.bytes_mut().fill(0);
            map.put_u32(OFF_MAGIC, MAGIC);
            map.put_u32(OFF_LEN, STATUS_BLOCK_LEN as u32);
            map.flush()?;
        }
        Ok((StatusBlock { map }, fresh))
    }

    /// Maps an existing record without creating or sweeping anything.
    /// For sibling tools; fails when no record of this layout exists.
    pub fn attach_existing(fifo_dir: &Path) -> Result<Self> {
        let path = fifo_dir.join(Self::file_name());
        if std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) != STATUS_BLOCK_LEN as u64 {
            return Err(crate::StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no status record for this layout",
            )));
        }
        let map = MapFile::open(&path, STATUS_BLOCK_LEN as u64)?;
        if map.get_u32(OFF_MAGIC) != MAGIC {
            return Err(crate::StoreError::Corrupt {
                path,
                what: "bad status magic",
            });
        }
        Ok(StatusBlock { map })
    }

    pub fn role_status(&self, role: usize) -> RoleStatus {
        RoleStatus::from_u8(self.map.get_u8(OFF_ROLES + role))
    }

    pub fn set_role_status(&mut self, role: usize, status: RoleStatus) {
        self.map.put_u8(OFF_ROLES + role, status as u8);
    }

    pub fn fork_count(&self) -> u32 {
        self.map.get_u32(OFF_FORKS)
    }

    pub fn count_fork(&mut self) {
        let v = self.map.get_u32(OFF_FORKS).wrapping_add(1);
        self.map.put_u32(OFF_FORKS, v);
    }

    pub fn burst_count(&self) -> u32 {
        self.map.get_u32(OFF_BURSTS)
    }

    pub fn count_burst(&mut self) {
        let v = self.map.get_u32(OFF_BURSTS).wrapping_add(1);
        self.map.put_u32(OFF_BURSTS, v);
    }

    pub fn dir_scan_count(&self) -> u32 {
        self.map.get_u32(OFF_DIR_SCANS)
    }

    pub fn count_dir_scan(&mut self) {
        let v = self.map.get_u32(OFF_DIR_SCANS).wrapping_add(1);
        self.map.put_u32(OFF_DIR_SCANS, v);
    }

    pub fn max_queue_length(&self) -> u32 {
        self.map.get_u32(OFF_MAX_QUEUE)
    }

    /// Records a new queue-length high-water mark.
    pub fn note_queue_length(&mut self, len: u32) {
        if len > self.map.get_u32(OFF_MAX_QUEUE) {
            self.map.put_u32(OFF_MAX_QUEUE, len);
        }
    }

    /// Zeroes the per-day counters after they were logged.
    pub fn reset_daily_counters(&mut self) {
        self.map.put_u32(OFF_FORKS, 0);
        self.map.put_u32(OFF_BURSTS, 0);
        self.map.put_u32(OFF_DIR_SCANS, 0);
        self.map.put_u32(OFF_MAX_QUEUE, 0);
    }

    pub fn start_time(&self) -> i64 {
        self.map.get_i64(OFF_START_TIME)
    }

    pub fn set_start_time(&mut self, t: i64) {
        self.map.put_i64(OFF_START_TIME, t);
    }

    pub fn uid(&self) -> u32 {
        self.map.get_u32(OFF_UID)
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.map.put_u32(OFF_UID, uid);
    }

    pub fn hostname(&self) -> String {
        String::from_utf8_lossy(self.map.get_bytes_padded(OFF_HOSTNAME, HOSTNAME_LEN)).into_owned()
    }

    pub fn set_hostname(&mut self, name: &str) {
        self.map
            .put_bytes_padded(OFF_HOSTNAME, HOSTNAME_LEN, name.as_bytes());
    }

    /// Blanks the host name; sibling tools read that as "system down".
    pub fn clear_hostname(&mut self) {
        self.map.put_bytes_padded(OFF_HOSTNAME, HOSTNAME_LEN, b"");
    }

    /// Shifts the ring for one log type and appends the newest bucket.
    pub fn history_shift(&mut self, kind: usize, value: u8) {
        let base = OFF_HISTORY + kind * LOG_HISTORY_LEN;
        let bytes = self.map.bytes_mut();
        bytes.copy_within(base + 1..base + LOG_HISTORY_LEN, base);
        bytes[base + LOG_HISTORY_LEN - 1] = value;
    }

    pub fn history(&self, kind: usize) -> [u8; LOG_HISTORY_LEN] {
        let base = OFF_HISTORY + kind * LOG_HISTORY_LEN;
        let mut out = [0u8; LOG_HISTORY_LEN];
        out.copy_from_slice(&self.map.bytes()[base..base + LOG_HISTORY_LEN]);
        out
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_block_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let (block, fresh) = StatusBlock::attach(dir.path()).unwrap();
        assert!(fresh);
        assert_eq!(block.role_status(0), RoleStatus::Off);
        assert_eq!(block.fork_count(), 0);
        assert_eq!(block.hostname(), "");
    }

    #[test]
    fn reattach_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut block, _) = StatusBlock::attach(dir.path()).unwrap();
            block.set_role_status(3, RoleStatus::On);
            block.count_fork();
            block.count_fork();
            block.set_hostname("ingest01");
            block.flush().unwrap();
        }
        let (block, fresh) = StatusBlock::attach(dir.path()).unwrap();
        assert!(!fresh);
        assert_eq!(block.role_status(3), RoleStatus::On);
        assert_eq!(block.fork_count(), 2);
        assert_eq!(block.hostname(), "ingest01");
    }

    #[test]
    fn stale_layouts_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("ferry_status.1");
        std::fs::write(&stale, b"old").unwrap();
        let (_, fresh) = StatusBlock::attach(dir.path()).unwrap();
        assert!(fresh);
        assert!(!stale.exists());
        assert!(dir.path().join(StatusBlock::file_name()).exists());
    }

    #[test]
    fn size_mismatch_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(StatusBlock::file_name());
        std::fs::write(&path, vec![0xffu8; 10]).unwrap();
        let (block, fresh) = StatusBlock::attach(dir.path()).unwrap();
        assert!(fresh);
        assert_eq!(block.fork_count(), 0);
    }

    #[test]
    fn attach_existing_never_creates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatusBlock::attach_existing(dir.path()).is_err());
        assert!(!dir.path().join(StatusBlock::file_name()).exists());

        let (mut writer, _) = StatusBlock::attach(dir.path()).unwrap();
        writer.set_hostname("ingest01");
        let sibling = StatusBlock::attach_existing(dir.path()).unwrap();
        assert_eq!(sibling.hostname(), "ingest01");
    }

    #[test]
    fn history_ring_shifts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut block, _) = StatusBlock::attach(dir.path()).unwrap();
        for v in 1..=3u8 {
            block.history_shift(HISTORY_TRANSFER, v);
        }
        let ring = block.history(HISTORY_TRANSFER);
        assert_eq!(&ring[LOG_HISTORY_LEN - 3..], &[1, 2, 3]);
        // Other rings untouched.
        assert_eq!(block.history(HISTORY_SYSTEM), [0; LOG_HISTORY_LEN]);
    }

    #[test]
    fn queue_length_keeps_the_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let (mut block, _) = StatusBlock::attach(dir.path()).unwrap();
        block.note_queue_length(5);
        block.note_queue_length(3);
        assert_eq!(block.max_queue_length(), 5);
        block.reset_daily_counters();
        assert_eq!(block.max_queue_length(), 0);
    }
}
