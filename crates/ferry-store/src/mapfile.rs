//! A growable shared file mapping with explicit little-endian accessors.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::Result;

/// A file mapped shared and writable, grown by `ftruncate` + remap.
///
/// All record types in this crate read and write through the endian-fixed
/// accessors below instead of casting the mapping to structs; the files
/// must mean the same thing to every build that shares them.
pub struct MapFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
}

impl MapFile {
    /// Opens (creating if needed) `path` and maps at least `min_len` bytes
    /// shared. An existing longer file keeps its length.
    pub fn open(path: &Path, min_len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < min_len {
            file.set_len(min_len)?;
        }
        // The mapping is only unsound if some other process truncates the
        // file under us; the attach locks rule that out.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(MapFile {
            file,
            map,
            path: path.to_path_buf(),
        })
    }

    /// Truncates to exactly `len` and remaps. Used both to grow and, on
    /// prune, to shrink.
    pub fn resize(&mut self, len: u64) -> Result<()> {
        self.map.flush()?;
        self.file.set_len(len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing file, for byte-range locks.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn get_u8(&self, off: usize) -> u8 {
        self.map[off]
    }

    pub fn put_u8(&mut self, off: usize, v: u8) {
        self.map[off] = v;
    }

    pub fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.map[off], self.map[off + 1]])
    }

    pub fn put_u16(&mut self, off: usize, v: u16) {
        self.map[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.map[off..off + 4]);
        u32::from_le_bytes(b)
    }

    pub fn put_u32(&mut self, off: usize, v: u32) {
        self.map[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.map[off..off + 8]);
        u64::from_le_bytes(b)
    }

    pub fn put_u64(&mut self, off: usize, v: u64) {
        self.map[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_i64(&self, off: usize) -> i64 {
        self.get_u64(off) as i64
    }

    pub fn put_i64(&mut self, off: usize, v: i64) {
        self.put_u64(off, v as u64);
    }

    /// Copies `v` into a fixed slot, zero-padding the remainder.
    pub fn put_bytes_padded(&mut self, off: usize, len: usize, v: &[u8]) {
        let take = v.len().min(len);
        self.map[off..off + take].copy_from_slice(&v[..take]);
        for b in &mut self.map[off + take..off + len] {
            *b = 0;
        }
    }

    /// Reads a zero-padded slot back, trailing NULs stripped.
    pub fn get_bytes_padded(&self, off: usize, len: usize) -> &[u8] {
        let slot = &self.map[off..off + len];
        let end = slot.iter().position(|&b| b == 0).unwrap_or(len);
        &slot[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        let mut map = MapFile::open(&path, 64).unwrap();
        map.put_u32(0, 0xdead_beef);
        map.put_u64(8, u64::MAX - 1);
        map.put_i64(16, -12345);
        map.put_bytes_padded(24, 16, b"alias");
        assert_eq!(map.get_u32(0), 0xdead_beef);
        assert_eq!(map.get_u64(8), u64::MAX - 1);
        assert_eq!(map.get_i64(16), -12345);
        assert_eq!(map.get_bytes_padded(24, 16), b"alias");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        {
            let mut map = MapFile::open(&path, 32).unwrap();
            map.put_u32(4, 42);
            map.flush().unwrap();
        }
        let map = MapFile::open(&path, 32).unwrap();
        assert_eq!(map.get_u32(4), 42);
    }

    #[test]
    fn resize_grows_and_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        let mut map = MapFile::open(&path, 16).unwrap();
        map.put_u32(0, 7);
        map.resize(4096).unwrap();
        assert_eq!(map.len(), 4096);
        assert_eq!(map.get_u32(0), 7);
    }
}
