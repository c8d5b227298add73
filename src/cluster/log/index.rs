//! Sparse offset index of a segment.
//!
//! Each entry is 8 bytes, big endian: `[u32 relative_offset][u32 position]`,
//! where `relative_offset = batch base offset - segment base offset` and
//! `position` is the byte position of that batch in the `.log` file. Entries
//! are strictly increasing in both fields.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::constants::INDEX_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub relative_offset: u32,
    pub position: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut raw = [0u8; INDEX_ENTRY_SIZE];
        raw[..4].copy_from_slice(&self.relative_offset.to_be_bytes());
        raw[4..].copy_from_slice(&self.position.to_be_bytes());
        raw
    }

    fn from_bytes(raw: &[u8]) -> Self {
        Self {
            relative_offset: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            position: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OffsetIndex {
    path: PathBuf,
    file: File,
    entries: RwLock<Vec<IndexEntry>>,
}

impl OffsetIndex {
    /// Open (or create) an index file and load its entries. A trailing
    /// partial entry is ignored and cut off.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len() as usize;
        let whole = len - len % INDEX_ENTRY_SIZE;
        let mut raw = vec![0u8; whole];
        file.read_exact_at(&mut raw, 0)?;
        if whole != len {
            file.set_len(whole as u64)?;
        }
        let entries = raw
            .chunks_exact(INDEX_ENTRY_SIZE)
            .map(IndexEntry::from_bytes)
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries: RwLock::new(entries),
        })
    }

    /// Whether the loaded entries are strictly increasing and point inside
    /// a log file of `segment_size` bytes.
    pub fn is_consistent(&self, segment_size: u64) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.windows(2).all(|w| {
            w[0].relative_offset < w[1].relative_offset && w[0].position < w[1].position
        }) && entries
            .last()
            .is_none_or(|e| u64::from(e.position) < segment_size)
    }

    pub fn append(&self, entry: IndexEntry) -> io::Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = entries.last()
            && (entry.relative_offset <= last.relative_offset || entry.position <= last.position)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("index entry {entry:?} does not follow {last:?}"),
            ));
        }
        let at = (entries.len() * INDEX_ENTRY_SIZE) as u64;
        self.file.write_all_at(&entry.to_bytes(), at)?;
        entries.push(entry);
        Ok(())
    }

    /// Greatest entry whose relative offset is `<= relative_offset`.
    pub fn lookup(&self, relative_offset: u32) -> Option<IndexEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let idx = entries.partition_point(|e| e.relative_offset <= relative_offset);
        idx.checked_sub(1).map(|i| entries[i])
    }

    /// Drop every entry pointing at or beyond `position`.
    pub fn truncate_to_position(&self, position: u32) -> io::Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let keep = entries.partition_point(|e| e.position < position);
        entries.truncate(keep);
        self.file.set_len((keep * INDEX_ENTRY_SIZE) as u64)
    }

    /// Replace the whole index.
    pub fn rebuild(&self, rebuilt: Vec<IndexEntry>) -> io::Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let raw: Vec<u8> = rebuilt.iter().flat_map(|e| e.to_bytes()).collect();
        self.file.set_len(0)?;
        self.file.write_all_at(&raw, 0)?;
        *entries = rebuilt;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(relative_offset: u32, position: u32) -> IndexEntry {
        IndexEntry {
            relative_offset,
            position,
        }
    }

    #[test]
    fn test_lookup_finds_floor_entry() {
        let dir = TempDir::new().unwrap();
        let index = OffsetIndex::open(&dir.path().join("0.index")).unwrap();
        index.append(entry(0, 0)).unwrap();
        index.append(entry(10, 4096)).unwrap();
        index.append(entry(25, 8200)).unwrap();

        assert_eq!(index.lookup(0), Some(entry(0, 0)));
        assert_eq!(index.lookup(9), Some(entry(0, 0)));
        assert_eq!(index.lookup(10), Some(entry(10, 4096)));
        assert_eq!(index.lookup(1000), Some(entry(25, 8200)));
    }

    #[test]
    fn test_lookup_on_empty_index() {
        let dir = TempDir::new().unwrap();
        let index = OffsetIndex::open(&dir.path().join("0.index")).unwrap();
        assert_eq!(index.lookup(5), None);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.index");
        {
            let index = OffsetIndex::open(&path).unwrap();
            index.append(entry(3, 100)).unwrap();
            index.append(entry(7, 5000)).unwrap();
            index.flush().unwrap();
        }
        let index = OffsetIndex::open(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup(8), Some(entry(7, 5000)));
        assert!(index.is_consistent(6000));
        assert!(!index.is_consistent(4000));
    }

    #[test]
    fn test_partial_trailing_entry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.index");
        let mut raw = entry(1, 10).to_bytes().to_vec();
        raw.extend_from_slice(&[0, 0, 0]);
        std::fs::write(&path, raw).unwrap();

        let index = OffsetIndex::open(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn test_non_monotonic_append_rejected() {
        let dir = TempDir::new().unwrap();
        let index = OffsetIndex::open(&dir.path().join("0.index")).unwrap();
        index.append(entry(5, 500)).unwrap();
        assert!(index.append(entry(5, 600)).is_err());
        assert!(index.append(entry(6, 400)).is_err());
    }

    #[test]
    fn test_truncate_to_position() {
        let dir = TempDir::new().unwrap();
        let index = OffsetIndex::open(&dir.path().join("0.index")).unwrap();
        index.append(entry(0, 0)).unwrap();
        index.append(entry(10, 4096)).unwrap();
        index.append(entry(20, 8192)).unwrap();
        index.truncate_to_position(4096).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(50), Some(entry(0, 0)));
    }

    #[test]
    fn test_rebuild_replaces_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.index");
        let index = OffsetIndex::open(&path).unwrap();
        index.append(entry(9, 9)).unwrap();
        index.rebuild(vec![entry(0, 0), entry(4, 4100)]).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    }
}
