//! Durable, segmented partition log.
//!
//! A partition lives in `<logdir>/<topic>-<partition>/` as a sequence of
//! segments `<base:020>.log` / `<base:020>.index` plus a `high-watermark`
//! checkpoint. Offsets are contiguous across segments and only the last
//! segment is written to.
//!
//! # Concurrency
//!
//! Appends and truncations are serialized by an async mutex. Readers take a
//! snapshot of the segment list and read positionally up to each segment's
//! published size, so they never observe a partially written entry.
//!
//! # Offsets
//!
//! - `log_start_offset`: base of the first segment.
//! - `log_end_offset` (LEO): offset the next appended record receives.
//! - `high_watermark` (HW): first offset not known to be on every in-sync
//!   replica. Offsets below it are committed.

mod index;
mod segment;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use self::segment::{OpenMode, Segment};
use super::config::LogConfig;
use crate::constants::{HIGH_WATERMARK_FILE, LOG_FILE_SUFFIX};
use crate::error::KafkaCode;
use crate::protocol::{self, RecordError};

/// Errors raised by a partition log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed validation. Fatal at startup.
    #[error("corrupt log {path} at byte {position}: {reason}")]
    Corrupt {
        path: PathBuf,
        position: u64,
        reason: String,
    },

    #[error("offset {offset} out of range [{log_start}, {log_end}]")]
    OffsetOutOfRange {
        offset: i64,
        log_start: i64,
        log_end: i64,
    },

    /// A replicated append did not start at the log end offset.
    #[error("non-contiguous append: expected offset {expected}, got {actual}")]
    NonContiguous { expected: i64, actual: i64 },

    #[error("invalid records: {0}")]
    InvalidRecords(#[from] RecordError),

    #[error("log is closed")]
    Closed,
}

impl LogError {
    pub fn to_kafka_code(&self) -> KafkaCode {
        match self {
            LogError::OffsetOutOfRange { .. } => KafkaCode::OffsetOutOfRange,
            LogError::InvalidRecords(_) => KafkaCode::CorruptMessage,
            LogError::Closed => KafkaCode::NotLeaderForPartition,
            LogError::Io(_) | LogError::Corrupt { .. } | LogError::NonContiguous { .. } => {
                KafkaCode::Unknown
            }
        }
    }
}

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// One or more whole entries.
    Records(Bytes),
    /// Nothing at or beyond the requested offset yet.
    NotYetAvailable,
}

/// Offsets covered by an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendInfo {
    pub base_offset: i64,
    pub last_offset: i64,
    /// LEO after the append.
    pub next_offset: i64,
}

/// Directory name of a partition.
pub fn partition_dir_name(topic: &str, partition: i32) -> String {
    format!("{topic}-{partition}")
}

pub struct PartitionLog {
    topic: Arc<str>,
    partition: i32,
    dir: PathBuf,
    config: LogConfig,
    segments: RwLock<Vec<Arc<Segment>>>,
    writer: Mutex<()>,
    leo: watch::Sender<i64>,
    high_watermark: watch::Sender<i64>,
    checkpointed_hw: AtomicI64,
    closed: AtomicBool,
}

impl std::fmt::Debug for PartitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLog")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("leo", &*self.leo.borrow())
            .field("high_watermark", &*self.high_watermark.borrow())
            .finish()
    }
}

impl PartitionLog {
    /// Open or create the log of a partition, recovering from a crash.
    ///
    /// A torn tail on the last segment is cut off with a warning. Any other
    /// inconsistency is reported as [`LogError::Corrupt`].
    pub fn open(topic: &str, partition: i32, config: &LogConfig) -> Result<Self, LogError> {
        let dir = config.dir.join(partition_dir_name(topic, partition));
        fs::create_dir_all(&dir)?;

        let bases = list_segment_bases(&dir)?;
        let mut segments = Vec::with_capacity(bases.len().max(1));
        for (i, base) in bases.iter().enumerate() {
            let mode = if i + 1 == bases.len() {
                OpenMode::Active
            } else {
                OpenMode::Sealed
            };
            let (segment, torn) =
                Segment::open(&dir, *base, config.index_interval_bytes, mode)?;
            if torn > 0 {
                warn!(
                    topic,
                    partition,
                    base_offset = base,
                    torn_bytes = torn,
                    "Truncated torn tail of partition log"
                );
            }
            if let Some(prev) = segments.last().map(|s: &Arc<Segment>| s.next_offset())
                && prev != *base
            {
                return Err(LogError::Corrupt {
                    path: dir.join(segment::segment_file_name(*base, LOG_FILE_SUFFIX)),
                    position: 0,
                    reason: format!("segment base {base} does not follow offset {prev}"),
                });
            }
            segments.push(Arc::new(segment));
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::create(
                &dir,
                0,
                config.index_interval_bytes,
            )?));
        }

        let leo = segments.last().map(|s| s.next_offset()).unwrap_or(0);
        let log_start = segments.first().map(|s| s.base_offset()).unwrap_or(0);
        let hw = read_hw_checkpoint(&dir)?
            .unwrap_or(log_start)
            .clamp(log_start, leo);

        info!(
            topic,
            partition,
            segments = segments.len(),
            log_start_offset = log_start,
            log_end_offset = leo,
            high_watermark = hw,
            "Opened partition log"
        );

        Ok(Self {
            topic: Arc::from(topic),
            partition,
            dir,
            config: config.clone(),
            segments: RwLock::new(segments),
            writer: Mutex::new(()),
            leo: watch::Sender::new(leo),
            high_watermark: watch::Sender::new(hw),
            checkpointed_hw: AtomicI64::new(hw),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_segment(&self) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed.load(Ordering::Acquire) {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn log_start_offset(&self) -> i64 {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .map(|s| s.base_offset())
            .unwrap_or(0)
    }

    pub fn log_end_offset(&self) -> i64 {
        *self.leo.borrow()
    }

    pub fn high_watermark(&self) -> i64 {
        *self.high_watermark.borrow()
    }

    /// Watch the log end offset.
    pub fn subscribe_leo(&self) -> watch::Receiver<i64> {
        self.leo.subscribe()
    }

    /// Watch the high watermark.
    pub fn subscribe_high_watermark(&self) -> watch::Receiver<i64> {
        self.high_watermark.subscribe()
    }

    /// Raise the high watermark. Lower values and values past the LEO are
    /// clamped; returns whether the HW moved.
    pub fn update_high_watermark(&self, hw: i64) -> bool {
        let hw = hw.min(self.log_end_offset());
        self.high_watermark.send_if_modified(|current| {
            if hw > *current {
                *current = hw;
                true
            } else {
                false
            }
        })
    }

    /// Leader path: assign offsets to every entry of `records` and append them.
    pub async fn append(&self, records: Bytes) -> Result<AppendInfo, LogError> {
        let entries = protocol::split_entries(&records)?;
        if entries.is_empty() {
            return Err(LogError::InvalidRecords(RecordError::Malformed(
                "empty record set".into(),
            )));
        }
        let _guard = self.writer.lock().await;
        self.ensure_open()?;

        let base_offset = self.log_end_offset();
        let mut next = base_offset;
        for entry in entries {
            let mut owned = BytesMut::from(&entry[..]);
            protocol::patch_base_offset(&mut owned, next);
            let after = next + protocol::record_count(&owned);
            if let Err(e) = self.write_entry(&owned, next, after) {
                self.leo.send_replace(next);
                return Err(e);
            }
            next = after;
        }
        self.leo.send_replace(next);
        debug!(
            topic = %self.topic,
            partition = self.partition,
            base_offset,
            next_offset = next,
            "Appended records"
        );
        Ok(AppendInfo {
            base_offset,
            last_offset: next - 1,
            next_offset: next,
        })
    }

    /// Follower path: append entries that already carry the leader's offsets.
    /// The first entry must start at the current LEO.
    pub async fn append_replicated(&self, records: Bytes) -> Result<AppendInfo, LogError> {
        let entries = protocol::split_entries(&records)?;
        let _guard = self.writer.lock().await;
        self.ensure_open()?;

        let base_offset = self.log_end_offset();
        let mut next = base_offset;
        for entry in entries {
            let entry_base = protocol::base_offset(&entry);
            if entry_base != next {
                // Keep what was already written.
                self.leo.send_replace(next);
                return Err(LogError::NonContiguous {
                    expected: next,
                    actual: entry_base,
                });
            }
            let after = next + protocol::record_count(&entry);
            if let Err(e) = self.write_entry(&entry, next, after) {
                self.leo.send_replace(next);
                return Err(e);
            }
            next = after;
        }
        self.leo.send_replace(next);
        Ok(AppendInfo {
            base_offset,
            last_offset: next - 1,
            next_offset: next,
        })
    }

    fn write_entry(&self, entry: &[u8], base: i64, next: i64) -> Result<(), LogError> {
        let active = self.active_segment().ok_or(LogError::Closed)?;
        let active = if active.can_hold(entry.len() as u64, next, self.config.segment_bytes) {
            active
        } else {
            self.roll(base)?
        };
        active.append(entry, base, next)?;
        Ok(())
    }

    fn roll(&self, base_offset: i64) -> Result<Arc<Segment>, LogError> {
        if let Some(active) = self.active_segment() {
            active.flush()?;
        }
        let segment = Arc::new(Segment::create(
            &self.dir,
            base_offset,
            self.config.index_interval_bytes,
        )?);
        self.segments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(segment.clone());
        info!(
            topic = %self.topic,
            partition = self.partition,
            base_offset,
            "Rolled new segment"
        );
        Ok(segment)
    }

    /// Read whole entries starting with the one that contains `offset`.
    ///
    /// Entries are returned while they end at or before `max_offset` and fit
    /// within `max_bytes`. The first entry is always returned whole, even if
    /// it exceeds `max_bytes`, so that readers always make progress.
    pub fn read(
        &self,
        offset: i64,
        max_bytes: usize,
        max_offset: i64,
    ) -> Result<ReadResult, LogError> {
        self.ensure_open()?;
        let segments = self.segments();
        let log_start = segments.first().map(|s| s.base_offset()).unwrap_or(0);
        let log_end = segments.last().map(|s| s.next_offset()).unwrap_or(0);
        if offset < log_start {
            return Err(LogError::OffsetOutOfRange {
                offset,
                log_start,
                log_end,
            });
        }
        if offset >= log_end.min(max_offset) {
            return Ok(ReadResult::NotYetAvailable);
        }

        let first = segments
            .partition_point(|s| s.base_offset() <= offset)
            .saturating_sub(1);
        let mut out = BytesMut::new();
        let mut located = false;
        let mut done = false;

        for segment in &segments[first..] {
            let from = if located {
                0
            } else {
                match segment.locate(offset)? {
                    Some((position, _)) => {
                        located = true;
                        position
                    }
                    None => continue,
                }
            };
            let mut end = from;
            while let Some(header) = segment.entry_at(end)? {
                let total = out.len() as u64 + (end - from) + header.size;
                let first_entry = out.is_empty() && end == from;
                if header.next_offset > max_offset || (total > max_bytes as u64 && !first_entry) {
                    done = true;
                    break;
                }
                end += header.size;
            }
            if end > from {
                out.extend_from_slice(&segment.read(from, (end - from) as usize)?);
            }
            if done {
                break;
            }
        }

        if out.is_empty() {
            Ok(ReadResult::NotYetAvailable)
        } else {
            Ok(ReadResult::Records(out.freeze()))
        }
    }

    /// Remove all records at or beyond `offset`. A batch straddling `offset`
    /// is removed whole. Returns the new LEO.
    pub async fn truncate(&self, offset: i64) -> Result<i64, LogError> {
        let _guard = self.writer.lock().await;
        self.ensure_open()?;
        let leo = self.log_end_offset();
        if offset >= leo {
            return Ok(leo);
        }

        let doomed: Vec<Arc<Segment>> = {
            let mut segments = self.segments.write().unwrap_or_else(PoisonError::into_inner);
            let keep = segments
                .partition_point(|s| s.base_offset() < offset)
                .max(1);
            segments.split_off(keep)
        };
        for segment in &doomed {
            segment.delete()?;
        }

        let active = self.active_segment().ok_or(LogError::Closed)?;
        let new_leo = active.truncate_to(offset)?;
        active.flush()?;
        self.leo.send_replace(new_leo);

        let hw_moved_back = self.high_watermark.send_if_modified(|hw| {
            if *hw > new_leo {
                *hw = new_leo;
                true
            } else {
                false
            }
        });
        if hw_moved_back {
            warn!(
                topic = %self.topic,
                partition = self.partition,
                new_leo,
                "Truncation moved the high watermark back"
            );
        }
        warn!(
            topic = %self.topic,
            partition = self.partition,
            requested = offset,
            old_leo = leo,
            new_leo,
            "Truncated partition log"
        );
        Ok(new_leo)
    }

    /// First offset whose batch carries a timestamp `>= timestamp`.
    pub fn offset_for_timestamp(&self, timestamp: i64) -> Result<Option<i64>, LogError> {
        self.ensure_open()?;
        for segment in self.segments() {
            if let Some(offset) = segment.find_timestamp(timestamp)? {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    /// Sync the active segment to disk.
    pub async fn flush(&self) -> Result<(), LogError> {
        let _guard = self.writer.lock().await;
        if let Some(active) = self.active_segment() {
            active.flush()?;
        }
        Ok(())
    }

    /// Persist the current high watermark if it changed since the last checkpoint.
    pub fn checkpoint_high_watermark(&self) -> Result<(), LogError> {
        let hw = self.high_watermark();
        if self.checkpointed_hw.swap(hw, Ordering::AcqRel) == hw {
            return Ok(());
        }
        write_hw_checkpoint(&self.dir, hw)?;
        Ok(())
    }

    /// Flush, checkpoint the HW and refuse further operations.
    pub async fn close(&self) -> Result<(), LogError> {
        let _guard = self.writer.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(active) = self.active_segment() {
            active.flush()?;
        }
        write_hw_checkpoint(&self.dir, self.high_watermark())?;
        debug!(topic = %self.topic, partition = self.partition, "Closed partition log");
        Ok(())
    }

    /// Close the log and remove its directory.
    pub async fn delete(&self) -> Result<(), LogError> {
        let _guard = self.writer.lock().await;
        self.closed.store(true, Ordering::Release);
        self.segments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                info!(topic = %self.topic, partition = self.partition, "Deleted partition log");
                Ok(())
            }
        }
    }
}

fn list_segment_bases(dir: &Path) -> io::Result<Vec<i64>> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_FILE_SUFFIX) {
            continue;
        }
        if let Some(base) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            bases.push(base);
        }
    }
    bases.sort_unstable();
    Ok(bases)
}

fn read_hw_checkpoint(dir: &Path) -> Result<Option<i64>, LogError> {
    let path = dir.join(HIGH_WATERMARK_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| LogError::Corrupt {
                path,
                position: 0,
                reason: format!("bad high watermark checkpoint: {e}"),
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_hw_checkpoint(dir: &Path, hw: i64) -> io::Result<()> {
    let path = dir.join(HIGH_WATERMARK_FILE);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{hw}\n"))?;
    fs::rename(&tmp, &path)
}
