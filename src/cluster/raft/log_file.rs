//! On-disk files backing the raft log and vote.
//!
//! `raft.log` is append-only. Each record is framed as
//! `[u32 len][u32 crc32c][bincode RaftLogRecord]` (big endian). Replaying the
//! records in order rebuilds the in-memory log: entries are inserted,
//! truncations and purges remove them. The file is rewritten after a purge
//! so it does not grow without bound.
//!
//! On open a torn trailing record (crash mid-write) is cut off with a warning;
//! a checksum or decode failure anywhere is reported as `InvalidData` and must
//! abort startup.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use openraft::{Entry, LogId, Vote};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{RaftNodeId, TypeConfig};
use crate::protocol::crc32c;

const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftLogRecord {
    Entry(Entry<TypeConfig>),
    /// Remove every entry with index `>= since`.
    TruncateSince(u64),
    /// Remove every entry up to and including this id.
    PurgeUpto(LogId<RaftNodeId>),
}

/// State rebuilt from `raft.log`.
#[derive(Default)]
pub(crate) struct RecoveredLog {
    pub entries: BTreeMap<u64, Entry<TypeConfig>>,
    pub last_purged: Option<LogId<RaftNodeId>>,
}

impl RecoveredLog {
    fn replay(&mut self, record: RaftLogRecord) {
        match record {
            RaftLogRecord::Entry(entry) => {
                self.entries.insert(entry.log_id.index, entry);
            }
            RaftLogRecord::TruncateSince(since) => {
                self.entries.retain(|&index, _| index < since);
            }
            RaftLogRecord::PurgeUpto(log_id) => {
                self.entries.retain(|&index, _| index > log_id.index);
                self.last_purged = Some(log_id);
            }
        }
    }
}

pub(crate) struct RaftLogFile {
    path: PathBuf,
    file: File,
}

impl RaftLogFile {
    /// Open `path`, replaying its records.
    pub fn open(path: &Path) -> io::Result<(Self, RecoveredLog)> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut recovered = RecoveredLog::default();
        let mut pos = 0usize;
        let mut records = 0usize;
        while pos < raw.len() {
            let Some(header) = raw.get(pos..pos + RECORD_HEADER_SIZE) else {
                break;
            };
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let stored_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let start = pos + RECORD_HEADER_SIZE;
            let Some(body) = raw.get(start..start + len) else {
                break;
            };

            let computed = crc32c(body);
            if computed != stored_crc {
                return Err(corrupt(
                    path,
                    pos,
                    format!("checksum mismatch (stored {stored_crc:#x}, computed {computed:#x})"),
                ));
            }
            let record: RaftLogRecord = bincode::deserialize(body)
                .map_err(|e| corrupt(path, pos, format!("undecodable record: {e}")))?;
            recovered.replay(record);
            records += 1;
            pos = start + len;
        }

        if pos < raw.len() {
            warn!(
                path = %path.display(),
                valid_bytes = pos,
                torn_bytes = raw.len() - pos,
                "Truncating torn record at the end of the raft log"
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if pos < raw.len() {
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }

        debug!(
            path = %path.display(),
            records,
            entries = recovered.entries.len(),
            "Replayed raft log"
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            recovered,
        ))
    }

    /// Append records and sync them to disk.
    pub fn append<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a RaftLogRecord>,
    ) -> io::Result<()> {
        let mut buf = Vec::new();
        for record in records {
            encode_record(record, &mut buf)?;
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()
    }

    /// Replace the file with a compacted copy holding `entries`.
    pub fn rewrite<'a>(
        &mut self,
        last_purged: Option<LogId<RaftNodeId>>,
        entries: impl IntoIterator<Item = &'a Entry<TypeConfig>>,
    ) -> io::Result<()> {
        let mut buf = Vec::new();
        if let Some(log_id) = last_purged {
            encode_record(&RaftLogRecord::PurgeUpto(log_id), &mut buf)?;
        }
        for entry in entries {
            encode_record(&RaftLogRecord::Entry(entry.clone()), &mut buf)?;
        }

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&buf)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

fn encode_record(record: &RaftLogRecord, buf: &mut Vec<u8>) -> io::Result<()> {
    let body =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c(&body).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

fn corrupt(path: &Path, position: usize, reason: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "corrupt raft log {} at byte {position}: {reason}",
            path.display()
        ),
    )
}

pub(crate) fn read_vote(path: &Path) -> io::Result<Option<Vote<RaftNodeId>>> {
    match fs::read(path) {
        Ok(raw) => bincode::deserialize(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write the vote through a temp file so a crash leaves either the old or
/// the new vote.
pub(crate) fn write_vote(path: &Path, vote: &Vote<RaftNodeId>) -> io::Result<()> {
    let raw =
        bincode::serialize(vote).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    {
        let mut out = File::create(&tmp)?;
        out.write_all(&raw)?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload};
    use tempfile::TempDir;

    fn entry(term: u64, index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        {
            let (mut file, recovered) = RaftLogFile::open(&path).unwrap();
            assert!(recovered.entries.is_empty());
            let records: Vec<_> = (1..=5).map(|i| RaftLogRecord::Entry(entry(1, i))).collect();
            file.append(&records).unwrap();
            file.append(&[RaftLogRecord::TruncateSince(4)]).unwrap();
            file.append(&[RaftLogRecord::PurgeUpto(entry(1, 1).log_id)]).unwrap();
        }

        let (_, recovered) = RaftLogFile::open(&path).unwrap();
        let indexes: Vec<u64> = recovered.entries.keys().copied().collect();
        assert_eq!(indexes, vec![2, 3]);
        assert_eq!(recovered.last_purged.map(|l| l.index), Some(1));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        {
            let (mut file, _) = RaftLogFile::open(&path).unwrap();
            file.append(&[RaftLogRecord::Entry(entry(1, 1))]).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        let mut raw = fs::read(&path).unwrap();
        raw.extend_from_slice(&[0, 0, 0, 40, 1, 2]);
        fs::write(&path, raw).unwrap();

        let (_, recovered) = RaftLogFile::open(&path).unwrap();
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        {
            let (mut file, _) = RaftLogFile::open(&path).unwrap();
            file.append(&[RaftLogRecord::Entry(entry(1, 1))]).unwrap();
        }
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        let err = RaftLogFile::open(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_rewrite_keeps_remaining_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        let (mut file, _) = RaftLogFile::open(&path).unwrap();
        let entries: Vec<_> = (1..=10).map(|i| entry(2, i)).collect();
        let records: Vec<_> = entries.iter().cloned().map(RaftLogRecord::Entry).collect();
        file.append(&records).unwrap();
        let before = fs::metadata(&path).unwrap().len();

        file.rewrite(Some(entries[6].log_id), &entries[7..]).unwrap();
        file.append(&[RaftLogRecord::Entry(entry(2, 11))]).unwrap();
        assert!(fs::metadata(&path).unwrap().len() < before);

        let (_, recovered) = RaftLogFile::open(&path).unwrap();
        let indexes: Vec<u64> = recovered.entries.keys().copied().collect();
        assert_eq!(indexes, vec![8, 9, 10, 11]);
        assert_eq!(recovered.last_purged.map(|l| l.index), Some(7));
    }

    #[test]
    fn test_vote_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vote");
        assert_eq!(read_vote(&path).unwrap(), None);
        let vote = Vote::new(3, 2);
        write_vote(&path, &vote).unwrap();
        assert_eq!(read_vote(&path).unwrap(), Some(vote));
    }
}
