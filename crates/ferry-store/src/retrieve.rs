//! The durable retrieve list: one row per remote file of a source.
//!
//! Workers attached to the same source coordinate exclusively through
//! this record: a process-level gate serializes resets, and one advisory
//! lock per row serializes assignment. A row is assigned to at most one
//! worker at any time; that worker fetches the file, marks the row
//! retrieved and releases it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::lock;
use crate::mapfile::MapFile;
use crate::{Result, StoreError};

/// Fixed name slot per row.
pub const MAX_FILENAME: usize = 256;

const MAGIC: u32 = 0x534C_5246; // "FRLS"
const FORMAT_VERSION: u32 = 2;
const HEADER_LEN: usize = 16;
const ROW_LEN: usize = 288;

/// Rows added per grow step.
const GROW_STEP: usize = 64;

// Row field offsets.
const ROW_SIZE: usize = 0;
const ROW_PREV_SIZE: usize = 8;
const ROW_MTIME: usize = 16;
const ROW_FLAGS: usize = 24;
const ROW_ASSIGNED: usize = 25;
const ROW_NAME_LEN: usize = 26;
const ROW_NAME: usize = 28;

const FLAG_GOT_DATE: u8 = 0x01;
const FLAG_RETRIEVED: u8 = 0x02;
const FLAG_IN_LIST: u8 = 0x04;

// Advisory lock regions. Decoupled from the data layout on purpose.
const LOCK_ATTACH: u64 = 0;
const LOCK_PROC: u64 = 1;
const LOCK_ROW_BASE: u64 = 8;

/// One decoded row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveEntry {
    pub name: String,
    pub size: u64,
    /// Size at the previous listing; append-only mode fetches the delta.
    pub prev_size: u64,
    pub mtime: i64,
    /// The listing supplied a real modification date.
    pub got_date: bool,
    pub retrieved: bool,
    /// Present in the most recent listing; rows without it are pruned.
    pub in_list: bool,
    /// 0 = unassigned, otherwise worker id + 1.
    pub assigned: u8,
}

impl RetrieveEntry {
    pub fn new(name: impl Into<String>, size: u64, mtime: i64) -> Self {
        RetrieveEntry {
            name: name.into(),
            size,
            mtime,
            got_date: mtime != 0,
            in_list: true,
            ..Default::default()
        }
    }
}

enum Storage {
    Shared(MapFile),
    Private(Vec<u8>),
}

/// The mapped (or, for transient sources, private) list.
pub struct RetrieveList {
    storage: Storage,
    /// Separate handle for the advisory locks; POSIX record locks are per
    /// process and inode, so this mirrors the mapping's file.
    lock_file: File,
    path: PathBuf,
    transient: bool,
}

impl RetrieveList {
    /// Attaches to the list of `source` under `ls_dir`.
    ///
    /// Durable mode maps the file shared and keeps whatever a previous run
    /// left. Transient mode (stupid / remove-after-fetch policies) holds
    /// the list in private memory and resets the backing file under the
    /// process gate, so concurrent helpers cannot race the truncation.
    pub fn attach(ls_dir: &Path, source: &str, transient: bool) -> Result<Self> {
        let path = ls_dir.join(source);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock::lock_shared(&lock_file, LOCK_ATTACH, 1)?;

        let storage = if transient {
            lock::lock_exclusive(&lock_file, LOCK_PROC, 1)?;
            lock_file.set_len(0)?;
            lock::unlock(&lock_file, LOCK_PROC, 1)?;
            let mut data = vec![0u8; HEADER_LEN];
            write_header(&mut data, 0);
            Storage::Private(data)
        } else {
            let min_len = (HEADER_LEN + GROW_STEP * ROW_LEN) as u64;
            let mut map = MapFile::open(&path, min_len)?;
            if map.get_u32(0) != MAGIC || map.get_u32(4) != FORMAT_VERSION {
                if map.get_u32(0) != 0 {
                    log::warn!(
                        "{}: unrecognized retrieve list format, starting fresh",
                        path.display()
                    );
                }
                let bytes = map.bytes_mut();
                bytes.fill(0);
                write_header(bytes, 0);
                map.flush()?;
            }
            let count = map.get_u32(8) as usize;
            if HEADER_LEN + count * ROW_LEN > map.len() {
                return Err(StoreError::Corrupt {
                    path,
                    what: "row count exceeds the mapping",
                });
            }
            Storage::Shared(map)
        };

        Ok(RetrieveList {
            storage,
            lock_file,
            path,
            transient,
        })
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Shared(map) => map.bytes(),
            Storage::Private(vec) => vec,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Shared(map) => map.bytes_mut(),
            Storage::Private(vec) => vec,
        }
    }

    pub fn count(&self) -> usize {
        get_u32_at(self.data(), 8) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn capacity(&self) -> usize {
        (self.data().len() - HEADER_LEN) / ROW_LEN
    }

    fn row_off(index: usize) -> usize {
        HEADER_LEN + index * ROW_LEN
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let count = self.count();
        if index >= count {
            return Err(StoreError::RowOutOfRange { index, count });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<RetrieveEntry> {
        self.check_index(index)?;
        let data = self.data();
        let off = Self::row_off(index);
        let flags = data[off + ROW_FLAGS];
        let name_len = get_u16_at(data, off + ROW_NAME_LEN) as usize;
        let name_len = name_len.min(MAX_FILENAME);
        let name =
            String::from_utf8_lossy(&data[off + ROW_NAME..off + ROW_NAME + name_len]).into_owned();
        Ok(RetrieveEntry {
            name,
            size: get_u64_at(data, off + ROW_SIZE),
            prev_size: get_u64_at(data, off + ROW_PREV_SIZE),
            mtime: get_u64_at(data, off + ROW_MTIME) as i64,
            got_date: flags & FLAG_GOT_DATE != 0,
            retrieved: flags & FLAG_RETRIEVED != 0,
            in_list: flags & FLAG_IN_LIST != 0,
            assigned: data[off + ROW_ASSIGNED],
        })
    }

    /// Overwrites row `index`.
    pub fn set(&mut self, index: usize, entry: &RetrieveEntry) -> Result<()> {
        self.check_index(index)?;
        self.write_row(Self::row_off(index), entry)
    }

    fn write_row(&mut self, off: usize, entry: &RetrieveEntry) -> Result<()> {
        if entry.name.len() > MAX_FILENAME {
            return Err(StoreError::NameTooLong {
                len: entry.name.len(),
                max: MAX_FILENAME,
            });
        }
        let mut flags = 0u8;
        if entry.got_date {
            flags |= FLAG_GOT_DATE;
        }
        if entry.retrieved {
            flags |= FLAG_RETRIEVED;
        }
        if entry.in_list {
            flags |= FLAG_IN_LIST;
        }
        let name = entry.name.as_bytes().to_vec();
        let data = self.data_mut();
        put_u64_at(data, off + ROW_SIZE, entry.size);
        put_u64_at(data, off + ROW_PREV_SIZE, entry.prev_size);
        put_u64_at(data, off + ROW_MTIME, entry.mtime as u64);
        data[off + ROW_FLAGS] = flags;
        data[off + ROW_ASSIGNED] = entry.assigned;
        put_u16_at(data, off + ROW_NAME_LEN, name.len() as u16);
        data[off + ROW_NAME..off + ROW_NAME + name.len()].copy_from_slice(&name);
        for b in &mut data[off + ROW_NAME + name.len()..off + ROW_NAME + MAX_FILENAME] {
            *b = 0;
        }
        Ok(())
    }

    /// Appends a row, growing the store in fixed steps. The header count
    /// is written last so a reader never sees a half-written row.
    pub fn push(&mut self, entry: &RetrieveEntry) -> Result<usize> {
        let count = self.count();
        if count == self.capacity() {
            let new_len = HEADER_LEN + (count + GROW_STEP) * ROW_LEN;
            match &mut self.storage {
                Storage::Shared(map) => map.resize(new_len as u64)?,
                Storage::Private(vec) => vec.resize(new_len, 0),
            }
        }
        self.write_row(Self::row_off(count), entry)?;
        let data = self.data_mut();
        put_u32_at(data, 8, (count + 1) as u32);
        self.flush()?;
        Ok(count)
    }

    /// Linear scan by file name.
    pub fn find(&self, name: &str) -> Option<usize> {
        let data = self.data();
        for index in 0..self.count() {
            let off = Self::row_off(index);
            let name_len = (get_u16_at(data, off + ROW_NAME_LEN) as usize).min(MAX_FILENAME);
            if &data[off + ROW_NAME..off + ROW_NAME + name_len] == name.as_bytes() {
                return Some(index);
            }
        }
        None
    }

    /// Empties the list under the process gate.
    pub fn reset(&mut self) -> Result<()> {
        lock::lock_exclusive(&self.lock_file, LOCK_PROC, 1)?;
        let data = self.data_mut();
        put_u32_at(data, 8, 0);
        let result = self.flush();
        lock::unlock(&self.lock_file, LOCK_PROC, 1)?;
        result
    }

    /// Clears every row's in-list marker ahead of a fresh diff.
    pub fn clear_in_list(&mut self) -> Result<()> {
        for index in 0..self.count() {
            let off = Self::row_off(index) + ROW_FLAGS;
            let data = self.data_mut();
            data[off] &= !FLAG_IN_LIST;
        }
        Ok(())
    }

    /// Compacts away rows the last diff did not mark, shrinking the
    /// mapping in grow steps. Durable lists only; a transient list is
    /// rebuilt from scratch every cycle anyway.
    pub fn prune_not_in_list(&mut self) -> Result<usize> {
        let count = self.count();
        let mut kept = 0usize;
        for index in 0..count {
            let entry = self.get(index)?;
            if entry.in_list {
                if kept != index {
                    self.write_row(Self::row_off(kept), &entry)?;
                }
                kept += 1;
            }
        }
        let removed = count - kept;
        if removed > 0 {
            let data = self.data_mut();
            put_u32_at(data, 8, kept as u32);
            let capacity_rows = kept.div_ceil(GROW_STEP).max(1) * GROW_STEP;
            let wanted = HEADER_LEN + capacity_rows * ROW_LEN;
            if let Storage::Shared(map) = &mut self.storage {
                if wanted < map.len() {
                    map.resize(wanted as u64)?;
                }
            }
            self.flush()?;
        }
        Ok(removed)
    }

    /// Flushes the mapping (no-op for private storage).
    pub fn flush(&self) -> Result<()> {
        if let Storage::Shared(map) = &self.storage {
            map.flush()?;
        }
        Ok(())
    }

    fn row_lock_off(index: usize) -> u64 {
        LOCK_ROW_BASE + index as u64
    }

    /// Tries the row lock without blocking; `false` means another worker
    /// holds the row and it should simply be skipped.
    pub fn try_lock_row(&self, index: usize) -> Result<bool> {
        lock::try_lock_exclusive(&self.lock_file, Self::row_lock_off(index), 1)
    }

    pub fn lock_row(&self, index: usize) -> Result<()> {
        lock::lock_exclusive(&self.lock_file, Self::row_lock_off(index), 1)
    }

    pub fn unlock_row(&self, index: usize) -> Result<()> {
        lock::unlock(&self.lock_file, Self::row_lock_off(index), 1)
    }

    /// Assigns row `index` to `worker` if it is free. The caller must hold
    /// the row lock.
    pub fn assign(&mut self, index: usize, worker: u8) -> Result<bool> {
        self.check_index(index)?;
        let off = Self::row_off(index) + ROW_ASSIGNED;
        let data = self.data_mut();
        if data[off] != 0 {
            return Ok(false);
        }
        data[off] = worker.saturating_add(1);
        Ok(true)
    }

    /// Marks a fetched row done and releases the assignment. Flushed
    /// immediately so the next listing sees it.
    pub fn mark_retrieved(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let off = Self::row_off(index);
        let data = self.data_mut();
        data[off + ROW_FLAGS] |= FLAG_RETRIEVED;
        data[off + ROW_ASSIGNED] = 0;
        self.flush()
    }
}

impl Drop for RetrieveList {
    fn drop(&mut self) {
        if let Err(e) = lock::unlock(&self.lock_file, LOCK_ATTACH, 1) {
            log::debug!("{}: releasing attach lock failed: {e}", self.path.display());
        }
    }
}

fn write_header(data: &mut [u8], count: u32) {
    put_u32_at(data, 0, MAGIC);
    put_u32_at(data, 4, FORMAT_VERSION);
    put_u32_at(data, 8, count);
    put_u32_at(data, 12, 0);
}

fn get_u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn put_u16_at(data: &mut [u8], off: usize, v: u16) {
    data[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn get_u32_at(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn put_u32_at(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u64_at(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

fn put_u64_at(data: &mut [u8], off: usize, v: u64) {
    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> RetrieveEntry {
        RetrieveEntry::new(name, size, 1_700_000_000)
    }

    #[test]
    fn push_get_find() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        assert!(list.is_empty());
        list.push(&entry("a.grib", 100)).unwrap();
        list.push(&entry("b.grib", 200)).unwrap();
        assert_eq!(list.count(), 2);
        assert_eq!(list.find("b.grib"), Some(1));
        assert_eq!(list.find("c.grib"), None);
        let got = list.get(1).unwrap();
        assert_eq!(got.name, "b.grib");
        assert_eq!(got.size, 200);
        assert!(got.in_list);
        assert!(!got.retrieved);
    }

    #[test]
    fn durable_list_survives_reattach() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
            list.push(&entry("keep.me", 7)).unwrap();
        }
        let list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        assert_eq!(list.count(), 1);
        assert_eq!(list.get(0).unwrap().name, "keep.me");
    }

    #[test]
    fn transient_list_resets_on_attach() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
            list.push(&entry("old", 1)).unwrap();
        }
        let list = RetrieveList::attach(dir.path(), "src1", true).unwrap();
        assert!(list.is_empty());
        assert!(list.is_transient());
    }

    #[test]
    fn grows_past_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "big", false).unwrap();
        for i in 0..150 {
            list.push(&entry(&format!("file{i:03}"), i as u64)).unwrap();
        }
        assert_eq!(list.count(), 150);
        assert_eq!(list.get(149).unwrap().name, "file149");
        assert_eq!(list.find("file099"), Some(99));
    }

    #[test]
    fn assignment_is_exclusive_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        list.push(&entry("f", 1)).unwrap();
        assert!(list.try_lock_row(0).unwrap());
        assert!(list.assign(0, 3).unwrap());
        assert_eq!(list.get(0).unwrap().assigned, 4);
        // Already taken.
        assert!(!list.assign(0, 5).unwrap());
        list.unlock_row(0).unwrap();

        list.mark_retrieved(0).unwrap();
        let row = list.get(0).unwrap();
        assert!(row.retrieved);
        assert_eq!(row.assigned, 0);
    }

    #[test]
    fn prune_compacts_unlisted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        for name in ["a", "b", "c", "d"] {
            list.push(&entry(name, 1)).unwrap();
        }
        list.clear_in_list().unwrap();
        // Fresh diff saw only b and d.
        for index in [1usize, 3] {
            let mut row = list.get(index).unwrap();
            row.in_list = true;
            list.set(index, &row).unwrap();
        }
        let removed = list.prune_not_in_list().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(list.count(), 2);
        assert_eq!(list.get(0).unwrap().name, "b");
        assert_eq!(list.get(1).unwrap().name, "d");
        assert_eq!(list.find("a"), None);
    }

    #[test]
    fn rejects_oversized_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        let long = "x".repeat(MAX_FILENAME + 1);
        match list.push(&entry(&long, 1)) {
            Err(StoreError::NameTooLong { .. }) => {}
            other => panic!("expected NameTooLong, got {other:?}"),
        }
    }

    #[test]
    fn reset_clears_durable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src1", false).unwrap();
        list.push(&entry("a", 1)).unwrap();
        list.reset().unwrap();
        assert!(list.is_empty());
    }
}
