//! The host status array: per-remote-host counters, flags and job slots.
//!
//! Workers update error counters and byte-activity stamps; the
//! supervisor's stuck-transfer check reads them. Mutations go through
//! byte-range locks at named regions so updates from different worker
//! processes never interleave.

use std::path::Path;

use crate::lock;
use crate::mapfile::MapFile;
use crate::{Result, StoreError};

/// Transfer slots per host.
pub const HOST_JOB_SLOTS: usize = 5;
/// Longest host alias that fits its slot.
pub const MAX_HOST_ALIAS: usize = 39;

const MAGIC: u32 = 0x5453_4846; // "FHST"
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

const HOST_ALIAS: usize = 0;
const ALIAS_SLOT: usize = 40;
const HOST_ERRORS: usize = 40;
const HOST_ACTIVE: usize = 44;
const HOST_FLAGS: usize = 48;
const HOST_LAST_RETRY: usize = 52;
const HOST_SLOTS: usize = 60;
const SLOT_LEN: usize = 24;
const HOST_LEN: usize = HOST_SLOTS + HOST_JOB_SLOTS * SLOT_LEN + 4; // 184

const SLOT_PID: usize = 0;
const SLOT_BYTES: usize = 8;
const SLOT_ACTIVITY: usize = 16;

const FLAG_QUEUE_STOPPED: u8 = 0x01;
const FLAG_DIR_DISABLED: u8 = 0x02;

const GROW_STEP: usize = 8;

// Named lock regions, decoupled from the data layout.
const LOCK_ERROR_BASE: u64 = 1_000_000;
const LOCK_STATUS_BASE: u64 = 2_000_000;

/// One job slot: which process transfers, and how alive it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSlot {
    pub pid: i32,
    pub bytes_done: u64,
    /// Seconds since the epoch of the last observed byte activity.
    pub last_activity: i64,
}

/// Decoded view of one host row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub alias: String,
    pub error_counter: u32,
    pub active_transfers: u32,
    pub queue_stopped: bool,
    pub dir_disabled: bool,
    pub last_retry: i64,
    pub slots: [JobSlot; HOST_JOB_SLOTS],
}

/// The mapped host array.
pub struct HostTable {
    map: MapFile,
}

impl HostTable {
    pub fn attach(path: &Path) -> Result<Self> {
        let min_len = (HEADER_LEN + GROW_STEP * HOST_LEN) as u64;
        let mut map = MapFile::open(path, min_len)?;
        if map.get_u32(0) != MAGIC || map.get_u32(4) != FORMAT_VERSION {
            if map.get_u32(0) != 0 {
                log::warn!(
                    "{}: unrecognized host table format, starting fresh",
                    path.display()
                );
            }
            map.bytes_mut().fill(0);
            map.put_u32(0, MAGIC);
            map.put_u32(4, FORMAT_VERSION);
            map.flush()?;
        }
        Ok(HostTable { map })
    }

    pub fn count(&self) -> usize {
        self.map.get_u32(8) as usize
    }

    fn capacity(&self) -> usize {
        (self.map.len() - HEADER_LEN) / HOST_LEN
    }

    fn host_off(index: usize) -> usize {
        HEADER_LEN + index * HOST_LEN
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let count = self.count();
        if index >= count {
            return Err(StoreError::RowOutOfRange { index, count });
        }
        Ok(())
    }

    pub fn find(&self, alias: &str) -> Option<usize> {
        (0..self.count()).find(|&i| {
            self.map
                .get_bytes_padded(Self::host_off(i) + HOST_ALIAS, ALIAS_SLOT)
                == alias.as_bytes()
        })
    }

    /// Adds a host row, growing the mapping in steps.
    pub fn add(&mut self, alias: &str) -> Result<usize> {
        if alias.len() > MAX_HOST_ALIAS {
            return Err(StoreError::NameTooLong {
                len: alias.len(),
                max: MAX_HOST_ALIAS,
            });
        }
        let count = self.count();
        if count == self.capacity() {
            let new_len = HEADER_LEN + (count + GROW_STEP) * HOST_LEN;
            self.map.resize(new_len as u64)?;
        }
        let off = Self::host_off(count);
        for b in &mut self.map.bytes_mut()[off..off + HOST_LEN] {
            *b = 0;
        }
        self.map
            .put_bytes_padded(off + HOST_ALIAS, ALIAS_SLOT, alias.as_bytes());
        self.map.put_u32(8, (count + 1) as u32);
        self.map.flush()?;
        Ok(count)
    }

    pub fn find_or_add(&mut self, alias: &str) -> Result<usize> {
        match self.find(alias) {
            Some(index) => Ok(index),
            None => self.add(alias),
        }
    }

    pub fn get(&self, index: usize) -> Result<HostEntry> {
        self.check_index(index)?;
        let off = Self::host_off(index);
        let flags = self.map.get_u8(off + HOST_FLAGS);
        let mut slots = [JobSlot::default(); HOST_JOB_SLOTS];
        for (n, slot) in slots.iter_mut().enumerate() {
            let s = off + HOST_SLOTS + n * SLOT_LEN;
            slot.pid = self.map.get_u32(s + SLOT_PID) as i32;
            slot.bytes_done = self.map.get_u64(s + SLOT_BYTES);
            slot.last_activity = self.map.get_i64(s + SLOT_ACTIVITY);
        }
        Ok(HostEntry {
            alias: String::from_utf8_lossy(
                self.map.get_bytes_padded(off + HOST_ALIAS, ALIAS_SLOT),
            )
            .into_owned(),
            error_counter: self.map.get_u32(off + HOST_ERRORS),
            active_transfers: self.map.get_u32(off + HOST_ACTIVE),
            queue_stopped: flags & FLAG_QUEUE_STOPPED != 0,
            dir_disabled: flags & FLAG_DIR_DISABLED != 0,
            last_retry: self.map.get_i64(off + HOST_LAST_RETRY),
            slots,
        })
    }

    // Error-counter region.

    pub fn lock_errors(&self, index: usize) -> Result<()> {
        lock::lock_exclusive(self.map.file(), LOCK_ERROR_BASE + index as u64, 1)
    }

    pub fn unlock_errors(&self, index: usize) -> Result<()> {
        lock::unlock(self.map.file(), LOCK_ERROR_BASE + index as u64, 1)
    }

    pub fn bump_errors(&mut self, index: usize) -> Result<u32> {
        self.check_index(index)?;
        let off = Self::host_off(index) + HOST_ERRORS;
        let v = self.map.get_u32(off).saturating_add(1);
        self.map.put_u32(off, v);
        Ok(v)
    }

    pub fn clear_errors(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.map.put_u32(Self::host_off(index) + HOST_ERRORS, 0);
        Ok(())
    }

    // Host-status region.

    pub fn lock_status(&self, index: usize) -> Result<()> {
        lock::lock_exclusive(self.map.file(), LOCK_STATUS_BASE + index as u64, 1)
    }

    pub fn unlock_status(&self, index: usize) -> Result<()> {
        lock::unlock(self.map.file(), LOCK_STATUS_BASE + index as u64, 1)
    }

    fn set_flag(&mut self, index: usize, flag: u8, on: bool) -> Result<()> {
        self.check_index(index)?;
        let off = Self::host_off(index) + HOST_FLAGS;
        let mut v = self.map.get_u8(off);
        if on {
            v |= flag;
        } else {
            v &= !flag;
        }
        self.map.put_u8(off, v);
        Ok(())
    }

    pub fn set_queue_stopped(&mut self, index: usize, stopped: bool) -> Result<()> {
        self.set_flag(index, FLAG_QUEUE_STOPPED, stopped)
    }

    pub fn set_dir_disabled(&mut self, index: usize, disabled: bool) -> Result<()> {
        self.set_flag(index, FLAG_DIR_DISABLED, disabled)
    }

    pub fn set_last_retry(&mut self, index: usize, t: i64) -> Result<()> {
        self.check_index(index)?;
        self.map.put_i64(Self::host_off(index) + HOST_LAST_RETRY, t);
        Ok(())
    }

    pub fn set_active_transfers(&mut self, index: usize, n: u32) -> Result<()> {
        self.check_index(index)?;
        self.map.put_u32(Self::host_off(index) + HOST_ACTIVE, n);
        Ok(())
    }

    /// Claims a job slot for `pid`, stamping it active now.
    pub fn set_slot(&mut self, index: usize, slot: usize, job: JobSlot) -> Result<()> {
        self.check_index(index)?;
        let s = Self::host_off(index) + HOST_SLOTS + slot * SLOT_LEN;
        self.map.put_u32(s + SLOT_PID, job.pid as u32);
        self.map.put_u64(s + SLOT_BYTES, job.bytes_done);
        self.map.put_i64(s + SLOT_ACTIVITY, job.last_activity);
        Ok(())
    }

    /// Adds transferred bytes to a slot and refreshes its activity stamp.
    /// This is the byte-activity trail the stuck-transfer check reads.
    pub fn note_activity(&mut self, index: usize, slot: usize, bytes: u64, now: i64) -> Result<()> {
        self.check_index(index)?;
        let s = Self::host_off(index) + HOST_SLOTS + slot * SLOT_LEN;
        let total = self.map.get_u64(s + SLOT_BYTES).saturating_add(bytes);
        self.map.put_u64(s + SLOT_BYTES, total);
        self.map.put_i64(s + SLOT_ACTIVITY, now);
        Ok(())
    }

    pub fn clear_slot(&mut self, index: usize, slot: usize) -> Result<()> {
        self.set_slot(index, slot, JobSlot::default())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_status");
        let mut table = HostTable::attach(&path).unwrap();
        let a = table.add("dwd-ingest").unwrap();
        let b = table.add("ecmwf").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.find("ecmwf"), Some(1));
        assert_eq!(table.find("nowhere"), None);
        assert_eq!(table.find_or_add("ecmwf").unwrap(), 1);
        assert_eq!(table.find_or_add("new-host").unwrap(), 2);

        let entry = table.get(0).unwrap();
        assert_eq!(entry.alias, "dwd-ingest");
        assert_eq!(entry.error_counter, 0);
        assert!(!entry.queue_stopped);
    }

    #[test]
    fn counters_flags_and_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_status");
        let mut table = HostTable::attach(&path).unwrap();
        let i = table.add("h1").unwrap();

        table.lock_errors(i).unwrap();
        assert_eq!(table.bump_errors(i).unwrap(), 1);
        assert_eq!(table.bump_errors(i).unwrap(), 2);
        table.unlock_errors(i).unwrap();

        table.set_queue_stopped(i, true).unwrap();
        table.set_last_retry(i, 1_700_000_000).unwrap();
        table.set_active_transfers(i, 2).unwrap();
        table
            .set_slot(
                i,
                0,
                JobSlot {
                    pid: 999,
                    bytes_done: 0,
                    last_activity: 1_700_000_000,
                },
            )
            .unwrap();
        table.note_activity(i, 0, 4096, 1_700_000_050).unwrap();

        let entry = table.get(i).unwrap();
        assert_eq!(entry.error_counter, 2);
        assert!(entry.queue_stopped);
        assert_eq!(entry.active_transfers, 2);
        assert_eq!(entry.slots[0].pid, 999);
        assert_eq!(entry.slots[0].bytes_done, 4096);
        assert_eq!(entry.slots[0].last_activity, 1_700_000_050);

        table.clear_errors(i).unwrap();
        table.clear_slot(i, 0).unwrap();
        let entry = table.get(i).unwrap();
        assert_eq!(entry.error_counter, 0);
        assert_eq!(entry.slots[0], JobSlot::default());
    }

    #[test]
    fn table_survives_reattach_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_status");
        {
            let mut table = HostTable::attach(&path).unwrap();
            for n in 0..20 {
                table.add(&format!("host{n}")).unwrap();
            }
        }
        let table = HostTable::attach(&path).unwrap();
        assert_eq!(table.count(), 20);
        assert_eq!(table.find("host19"), Some(19));
    }

    #[test]
    fn alias_length_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_status");
        let mut table = HostTable::attach(&path).unwrap();
        match table.add(&"x".repeat(MAX_HOST_ALIAS + 1)) {
            Err(StoreError::NameTooLong { .. }) => {}
            other => panic!("expected NameTooLong, got {other:?}"),
        }
    }
}
