//! One segment of a partition log: `<base>.log` plus its `<base>.index`.
//!
//! Entries are stored exactly as they arrive on the wire, each starting with
//! `[i64 base_offset][i32 length]`. The writer appends at the end and then
//! publishes the new size; readers never look past the published size.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;

use super::LogError;
use super::index::{IndexEntry, OffsetIndex};
use crate::constants::{INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX, LOG_OVERHEAD, RECORD_BATCH_HEADER_SIZE};
use crate::protocol::{self, CrcValidationResult};

/// Zero-padded file name of a segment component.
pub(crate) fn segment_file_name(base_offset: i64, suffix: &str) -> String {
    format!("{base_offset:020}.{suffix}")
}

/// Header fields of one stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHeader {
    pub base_offset: i64,
    /// Total size including the 12-byte log overhead.
    pub size: u64,
    /// Offset following the last record of this entry.
    pub next_offset: i64,
    pub max_timestamp: Option<i64>,
}

enum HeaderRead {
    Entry(EntryHeader),
    /// The entry runs past the end of the readable region.
    Torn,
    Invalid(String),
}

/// How much checking happens when a segment is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    /// Read-only segment: frames and offsets are checked, a torn entry is corruption.
    Sealed,
    /// Last segment: CRCs are checked too and a torn tail is cut off.
    Active,
}

#[derive(Debug)]
pub(crate) struct Segment {
    base_offset: i64,
    log_path: PathBuf,
    file: File,
    index: OffsetIndex,
    index_interval: u64,
    size: AtomicU64,
    next_offset: AtomicI64,
    bytes_since_index: AtomicU64,
}

impl Segment {
    /// Create a new empty segment, replacing leftovers with the same base.
    pub fn create(dir: &Path, base_offset: i64, index_interval: u64) -> io::Result<Self> {
        let log_path = dir.join(segment_file_name(base_offset, LOG_FILE_SUFFIX));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)?;
        let index_path = dir.join(segment_file_name(base_offset, INDEX_FILE_SUFFIX));
        let index = OffsetIndex::open(&index_path)?;
        index.rebuild(Vec::new())?;
        Ok(Self {
            base_offset,
            log_path,
            file,
            index,
            index_interval,
            size: AtomicU64::new(0),
            next_offset: AtomicI64::new(base_offset),
            bytes_since_index: AtomicU64::new(0),
        })
    }

    /// Open an existing segment and validate its contents. Returns the segment
    /// and the number of torn bytes cut from its tail.
    pub fn open(
        dir: &Path,
        base_offset: i64,
        index_interval: u64,
        mode: OpenMode,
    ) -> Result<(Self, u64), LogError> {
        let log_path = dir.join(segment_file_name(base_offset, LOG_FILE_SUFFIX));
        let file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let file_size = file.metadata()?.len();

        let corrupt = |position: u64, reason: String| LogError::Corrupt {
            path: log_path.clone(),
            position,
            reason,
        };

        let mut position = 0u64;
        let mut expected = base_offset;
        let mut rebuilt = Vec::new();
        let mut bytes_since_index = 0u64;
        let mut torn = 0u64;

        while position < file_size {
            let header = match read_header(&file, position, file_size)? {
                HeaderRead::Entry(header) => header,
                HeaderRead::Torn if mode == OpenMode::Active => {
                    torn = file_size - position;
                    file.set_len(position)?;
                    break;
                }
                HeaderRead::Torn => {
                    return Err(corrupt(position, "truncated entry in sealed segment".into()));
                }
                HeaderRead::Invalid(reason) => return Err(corrupt(position, reason)),
            };
            if header.base_offset != expected {
                return Err(corrupt(
                    position,
                    format!(
                        "non-contiguous offsets: expected {expected}, found {}",
                        header.base_offset
                    ),
                ));
            }
            if mode == OpenMode::Active {
                let mut entry = vec![0u8; header.size as usize];
                file.read_exact_at(&mut entry, position)?;
                if let CrcValidationResult::Invalid { expected, actual } =
                    protocol::validate_batch_crc(&entry)
                {
                    return Err(corrupt(
                        position,
                        format!("crc mismatch: stored {expected:#010x}, computed {actual:#010x}"),
                    ));
                }
            }
            if bytes_since_index >= index_interval {
                rebuilt.push(IndexEntry {
                    relative_offset: (header.base_offset - base_offset) as u32,
                    position: position as u32,
                });
                bytes_since_index = 0;
            }
            bytes_since_index += header.size;
            position += header.size;
            expected = header.next_offset;
        }

        let index_path = dir.join(segment_file_name(base_offset, INDEX_FILE_SUFFIX));
        let index = OffsetIndex::open(&index_path)?;
        if mode == OpenMode::Active || !index.is_consistent(position) || index.len() != rebuilt.len()
        {
            index.rebuild(rebuilt)?;
        }

        Ok((
            Self {
                base_offset,
                log_path,
                file,
                index,
                index_interval,
                size: AtomicU64::new(position),
                next_offset: AtomicI64::new(expected),
                bytes_since_index: AtomicU64::new(bytes_since_index),
            },
            torn,
        ))
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Committed size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether an entry of `len` bytes ending before `next_offset` fits.
    pub fn can_hold(&self, len: u64, next_offset: i64, segment_bytes: u64) -> bool {
        let offsets_fit = next_offset - self.base_offset <= i64::from(u32::MAX);
        self.is_empty() || (self.size() + len <= segment_bytes && offsets_fit)
    }

    /// Append one entry. Callers serialize appends.
    pub fn append(&self, entry: &[u8], base_offset: i64, next_offset: i64) -> io::Result<()> {
        let position = self.size();
        if self.bytes_since_index.load(Ordering::Relaxed) >= self.index_interval {
            self.index.append(IndexEntry {
                relative_offset: (base_offset - self.base_offset) as u32,
                position: position as u32,
            })?;
            self.bytes_since_index.store(0, Ordering::Relaxed);
        }
        self.file.write_all_at(entry, position)?;
        self.bytes_since_index
            .fetch_add(entry.len() as u64, Ordering::Relaxed);
        self.next_offset.store(next_offset, Ordering::Release);
        self.size
            .store(position + entry.len() as u64, Ordering::Release);
        Ok(())
    }

    pub fn read(&self, position: u64, len: usize) -> io::Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, position)?;
        Ok(Bytes::from(buf))
    }

    /// Header of the entry at `position`, or `None` at the end of the segment.
    pub fn entry_at(&self, position: u64) -> io::Result<Option<EntryHeader>> {
        let size = self.size();
        if position >= size {
            return Ok(None);
        }
        match read_header(&self.file, position, size)? {
            HeaderRead::Entry(header) => Ok(Some(header)),
            HeaderRead::Torn | HeaderRead::Invalid(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad entry at {} in {}", position, self.log_path.display()),
            )),
        }
    }

    /// Position and header of the entry containing `offset`.
    pub fn locate(&self, offset: i64) -> io::Result<Option<(u64, EntryHeader)>> {
        if offset < self.base_offset || offset >= self.next_offset() {
            return Ok(None);
        }
        let relative = (offset - self.base_offset).min(i64::from(u32::MAX)) as u32;
        let mut position = self
            .index
            .lookup(relative)
            .map(|e| u64::from(e.position))
            .unwrap_or(0);
        while let Some(header) = self.entry_at(position)? {
            if header.next_offset > offset {
                return Ok(Some((position, header)));
            }
            position += header.size;
        }
        Ok(None)
    }

    /// Remove every entry holding an offset `>= offset`. An entry straddling
    /// `offset` is removed whole. Returns the new next offset.
    pub fn truncate_to(&self, offset: i64) -> io::Result<i64> {
        let Some((position, header)) = self.locate(offset.max(self.base_offset))? else {
            return Ok(self.next_offset());
        };
        self.file.set_len(position)?;
        self.index.truncate_to_position(position as u32)?;
        self.size.store(position, Ordering::Release);
        self.next_offset.store(header.base_offset, Ordering::Release);

        // Recompute the distance from the last index entry.
        let from = self
            .index
            .lookup(u32::MAX)
            .map(|e| u64::from(e.position))
            .unwrap_or(0);
        self.bytes_since_index
            .store(position - from, Ordering::Relaxed);
        Ok(header.base_offset)
    }

    /// Base offset of the first entry whose max timestamp is `>= timestamp`.
    pub fn find_timestamp(&self, timestamp: i64) -> io::Result<Option<i64>> {
        let mut position = 0u64;
        while let Some(header) = self.entry_at(position)? {
            if header.max_timestamp.is_some_and(|ts| ts >= timestamp) {
                return Ok(Some(header.base_offset));
            }
            position += header.size;
        }
        Ok(None)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_data()?;
        self.index.flush()
    }

    pub fn delete(&self) -> io::Result<()> {
        fs::remove_file(&self.log_path)?;
        match fs::remove_file(self.index.path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn read_header(file: &File, position: u64, limit: u64) -> io::Result<HeaderRead> {
    let available = limit - position;
    if available < LOG_OVERHEAD as u64 {
        return Ok(HeaderRead::Torn);
    }
    let want = available.min(RECORD_BATCH_HEADER_SIZE as u64) as usize;
    let mut raw = vec![0u8; want];
    file.read_exact_at(&mut raw, position)?;

    let size = match protocol::entry_size(&raw) {
        None => return Ok(HeaderRead::Torn),
        Some(Err(length)) => return Ok(HeaderRead::Invalid(format!("negative length {length}"))),
        Some(Ok(size)) => size as u64,
    };
    if size > available {
        return Ok(HeaderRead::Torn);
    }
    if protocol::magic(&raw) == Some(crate::constants::RECORD_BATCH_MAGIC)
        && size < RECORD_BATCH_HEADER_SIZE as u64
    {
        return Ok(HeaderRead::Invalid(format!(
            "record batch of {size} bytes is shorter than its header"
        )));
    }
    let base_offset = protocol::base_offset(&raw);
    Ok(HeaderRead::Entry(EntryHeader {
        base_offset,
        size,
        next_offset: base_offset + protocol::record_count(&raw),
        max_timestamp: protocol::max_timestamp(&raw),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Record, encode_record_batch};
    use tempfile::TempDir;

    fn batch(base: i64, n: usize) -> Bytes {
        let records: Vec<Record> = (0..n)
            .map(|i| Record::new(None, Some(Bytes::from(vec![b'x'; 100])), 1_000 + i as i64))
            .collect();
        encode_record_batch(base, &records)
    }

    fn fill(segment: &Segment, batches: usize, per_batch: usize) {
        let mut next = segment.next_offset();
        for _ in 0..batches {
            let b = batch(next, per_batch);
            segment.append(&b, next, next + per_batch as i64).unwrap();
            next += per_batch as i64;
        }
    }

    #[test]
    fn test_append_and_locate() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 0, 256).unwrap();
        fill(&segment, 10, 3);
        assert_eq!(segment.next_offset(), 30);

        let (position, header) = segment.locate(7).unwrap().unwrap();
        assert_eq!(header.base_offset, 6);
        assert_eq!(header.next_offset, 9);
        assert!(position > 0);
        assert!(segment.locate(30).unwrap().is_none());
    }

    #[test]
    fn test_reopen_rebuilds_state() {
        let dir = TempDir::new().unwrap();
        let size = {
            let segment = Segment::create(dir.path(), 100, 256).unwrap();
            fill(&segment, 5, 2);
            segment.flush().unwrap();
            segment.size()
        };
        let (segment, torn) = Segment::open(dir.path(), 100, 256, OpenMode::Sealed).unwrap();
        assert_eq!(torn, 0);
        assert_eq!(segment.size(), size);
        assert_eq!(segment.next_offset(), 110);
        assert_eq!(segment.locate(109).unwrap().unwrap().1.base_offset, 108);
    }

    #[test]
    fn test_torn_tail_cut_on_active_segment() {
        let dir = TempDir::new().unwrap();
        let good = {
            let segment = Segment::create(dir.path(), 0, 4096).unwrap();
            fill(&segment, 3, 1);
            segment.size()
        };
        let path = dir.path().join(segment_file_name(0, LOG_FILE_SUFFIX));
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let partial = batch(3, 2);
        file.write_all_at(&partial[..partial.len() / 2], good).unwrap();

        let (segment, torn) = Segment::open(dir.path(), 0, 4096, OpenMode::Active).unwrap();
        assert_eq!(torn, (partial.len() / 2) as u64);
        assert_eq!(segment.size(), good);
        assert_eq!(segment.next_offset(), 3);
    }

    #[test]
    fn test_torn_entry_in_sealed_segment_is_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let segment = Segment::create(dir.path(), 0, 4096).unwrap();
            fill(&segment, 2, 1);
        }
        let path = dir.path().join(segment_file_name(0, LOG_FILE_SUFFIX));
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 5)
            .unwrap();
        let err = Segment::open(dir.path(), 0, 4096, OpenMode::Sealed).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { .. }));
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let segment = Segment::create(dir.path(), 0, 4096).unwrap();
            fill(&segment, 2, 1);
        }
        let path = dir.path().join(segment_file_name(0, LOG_FILE_SUFFIX));
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x55;
        fs::write(&path, raw).unwrap();
        let err = Segment::open(dir.path(), 0, 4096, OpenMode::Active).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { ref reason, .. } if reason.contains("crc")));
    }

    #[test]
    fn test_non_contiguous_offsets_are_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let segment = Segment::create(dir.path(), 0, 4096).unwrap();
            let first = batch(0, 2);
            segment.append(&first, 0, 2).unwrap();
            let gap = batch(5, 1);
            segment.append(&gap, 5, 6).unwrap();
        }
        let err = Segment::open(dir.path(), 0, 4096, OpenMode::Active).unwrap_err();
        assert!(
            matches!(err, LogError::Corrupt { ref reason, .. } if reason.contains("non-contiguous"))
        );
    }

    #[test]
    fn test_truncate_to_removes_whole_batches() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 0, 256).unwrap();
        fill(&segment, 6, 4);
        let next = segment.truncate_to(10).unwrap();
        assert_eq!(next, 8);
        assert_eq!(segment.next_offset(), 8);
        assert!(segment.locate(8).unwrap().is_none());
        fill(&segment, 1, 4);
        assert_eq!(segment.next_offset(), 12);
    }

    #[test]
    fn test_find_timestamp() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 0, 4096).unwrap();
        fill(&segment, 3, 2);
        assert_eq!(segment.find_timestamp(0).unwrap(), Some(0));
        assert_eq!(segment.find_timestamp(1_001).unwrap(), Some(0));
        assert_eq!(segment.find_timestamp(2_000).unwrap(), None);
    }

    #[test]
    fn test_can_hold() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 0, 4096).unwrap();
        assert!(segment.can_hold(10_000, 1, 1024));
        fill(&segment, 1, 1);
        assert!(!segment.can_hold(10_000, 2, 1024));
    }
}
