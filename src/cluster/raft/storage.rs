//! Raft storage implementation using openraft's RaftStorage trait (v1 API).
//!
//! Combined log and state machine storage. The log and vote are durable
//! files under the raft directory (see [`super::log_file`]); the metadata
//! state machine lives in memory and is rebuilt from the latest snapshot plus
//! re-applied log entries. Snapshots are persisted through an object store
//! (local filesystem in production, in-memory in tests).

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{self, Cursor};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::commands::MetadataResponse;
use super::log_file::{self, RaftLogFile, RaftLogRecord};
use super::state_machine::MetadataStateMachine;
use super::types::{RaftNodeId, TypeConfig};

const LOG_FILE_NAME: &str = "raft.log";
const VOTE_FILE_NAME: &str = "vote";
const CURRENT_SNAPSHOT: &str = "current.snapshot";
const CURRENT_META: &str = "current.meta";

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

/// Persisted snapshot data (cached in memory).
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

fn storage_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    e: impl ToString,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, io::Error::other(e.to_string()))
}

fn snapshot_error(verb: ErrorVerb, e: impl ToString) -> StorageError<RaftNodeId> {
    storage_error(ErrorSubject::Snapshot(None), verb, e)
}

/// Combined log and state machine storage for Raft.
///
/// Clones share all state; openraft's log reader and snapshot builder are
/// clones of the store.
#[derive(Clone)]
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    vote_path: PathBuf,
    /// Log entries indexed by log index, mirrored in `log_file`.
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    log_file: Arc<Mutex<RaftLogFile>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    sm: MetadataStateMachine,
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    snapshot_path: ObjectPath,
}

impl RaftStore {
    /// Open the durable log and vote in `raft_dir`.
    ///
    /// Fails with `InvalidData` when `raft.log` or `vote` is corrupt; the
    /// caller must not start with a damaged consensus log.
    pub fn open(
        raft_dir: &Path,
        object_store: Arc<dyn ObjectStore>,
        snapshot_prefix: &str,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(raft_dir)?;
        let (log_file, recovered) = RaftLogFile::open(&raft_dir.join(LOG_FILE_NAME))?;
        let vote_path = raft_dir.join(VOTE_FILE_NAME);
        let vote = log_file::read_vote(&vote_path)?;

        info!(
            raft_dir = %raft_dir.display(),
            entries = recovered.entries.len(),
            last_purged = ?recovered.last_purged.map(|l| l.index),
            vote = ?vote,
            "Opened raft storage"
        );

        Ok(Self {
            vote: Arc::new(RwLock::new(vote)),
            vote_path,
            log: Arc::new(RwLock::new(recovered.entries)),
            log_file: Arc::new(Mutex::new(log_file)),
            last_purged_log_id: Arc::new(RwLock::new(recovered.last_purged)),
            sm: MetadataStateMachine::new(),
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            snapshot_path: ObjectPath::from(snapshot_prefix),
        })
    }

    /// The metadata state machine fed by this store.
    pub fn state_machine(&self) -> MetadataStateMachine {
        self.sm.clone()
    }

    fn snapshot_object(&self, name: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{name}", self.snapshot_path))
    }

    /// Read one snapshot object, `None` when it does not exist.
    async fn read_object(
        &self,
        path: &ObjectPath,
    ) -> Result<Option<Bytes>, StorageError<RaftNodeId>> {
        match self.object_store.get(path).await {
            Ok(result) => result.bytes().await.map(Some).map_err(|e| {
                error!(error = %e, path = %path, "Snapshot object exists but could not be read");
                snapshot_error(ErrorVerb::Read, e)
            }),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => {
                error!(error = %e, path = %path, "Failed to access snapshot object");
                Err(snapshot_error(ErrorVerb::Read, e))
            }
        }
    }

    /// Load the latest snapshot on startup.
    ///
    /// Returns `Ok(false)` on a clean start. A metadata file that cannot be
    /// decoded, or whose data file is missing or undecodable, is an error:
    /// starting from damaged metadata is never safe.
    pub async fn load_snapshot_from_store(&self) -> Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let meta_path = self.snapshot_object(CURRENT_META);
        let Some(meta_bytes) = self.read_object(&meta_path).await? else {
            debug!("No existing snapshot found (clean start)");
            return Ok(false);
        };
        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(error = %e, path = %meta_path, "Snapshot metadata is corrupted");
            snapshot_error(ErrorVerb::Read, format!("snapshot metadata corruption: {e}"))
        })?;

        let data_path = self.snapshot_object(CURRENT_SNAPSHOT);
        let Some(data) = self.read_object(&data_path).await? else {
            error!(
                snapshot_id = %metadata.snapshot_id,
                path = %data_path,
                "Snapshot metadata exists but data file is missing"
            );
            return Err(snapshot_error(
                ErrorVerb::Read,
                "snapshot metadata exists but data file is missing",
            ));
        };
        let data = data.to_vec();
        self.sm.restore(&data).map_err(|e| {
            error!(error = %e, path = %data_path, "Snapshot data is corrupted");
            snapshot_error(ErrorVerb::Read, format!("snapshot data corruption: {e}"))
        })?;

        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored metadata snapshot"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot { meta, data });
        Ok(true)
    }

    /// Delete `temp-*` objects left behind by a crash during persistence.
    async fn cleanup_temp_files(&self) {
        let mut stream = self.object_store.list(Some(&self.snapshot_path));
        let mut temp_files = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => {
                    let is_temp = meta
                        .location
                        .filename()
                        .is_some_and(|name| name.starts_with("temp-"));
                    if is_temp {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => debug!(error = %e, "Error listing snapshot objects"),
            }
        }

        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "Cleaned up orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "Failed to delete temp snapshot file"),
            }
        }
    }

    /// Move `from` to `to`, falling back to copy + delete where rename is
    /// unsupported.
    async fn promote(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> Result<(), StorageError<RaftNodeId>> {
        if let Err(e) = self.object_store.rename(from, to).await {
            debug!(error = %e, from = %from, "Rename failed, falling back to copy");
            if let Err(copy_err) = self.object_store.copy(from, to).await {
                let _ = self.object_store.delete(from).await;
                return Err(snapshot_error(ErrorVerb::Write, copy_err));
            }
            let _ = self.object_store.delete(from).await;
        }
        Ok(())
    }

    /// Persist a snapshot.
    ///
    /// Data and metadata are written to `temp-<id>.*` first, then renamed
    /// into place, data before metadata. The metadata file is the commit
    /// marker: a crash at any point leaves the previous snapshot readable.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        let temp_data = self.snapshot_object(&format!("temp-{}.snapshot", meta.snapshot_id));
        let temp_meta = self.snapshot_object(&format!("temp-{}.meta", meta.snapshot_id));

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes =
            bincode::serialize(&metadata).map_err(|e| snapshot_error(ErrorVerb::Write, e))?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write snapshot data");
                snapshot_error(ErrorVerb::Write, e)
            })?;
        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::from(meta_bytes).into())
            .await
        {
            error!(error = %e, "Failed to write snapshot metadata");
            let _ = self.object_store.delete(&temp_data).await;
            return Err(snapshot_error(ErrorVerb::Write, e));
        }

        if let Err(e) = self
            .promote(&temp_data, &self.snapshot_object(CURRENT_SNAPSHOT))
            .await
        {
            let _ = self.object_store.delete(&temp_meta).await;
            return Err(e);
        }
        self.promote(&temp_meta, &self.snapshot_object(CURRENT_META))
            .await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted metadata snapshot"
        );
        Ok(())
    }

    async fn write_log(&self, records: &[RaftLogRecord]) -> Result<(), StorageError<RaftNodeId>> {
        self.log_file
            .lock()
            .await
            .append(records)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        log_file::write_vote(&self.vote_path, vote)
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().next_back().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let records: Vec<RaftLogRecord> = entries.into_iter().map(RaftLogRecord::Entry).collect();
        self.write_log(&records).await?;

        let mut log = self.log.write().await;
        for record in records {
            if let RaftLogRecord::Entry(entry) = record {
                log.insert(entry.log_id.index, entry);
            }
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.write_log(&[RaftLogRecord::TruncateSince(log_id.index)])
            .await?;
        self.log.write().await.retain(|&index, _| index < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log_file = self.log_file.lock().await;
        let mut log = self.log.write().await;
        log.retain(|&index, _| index > log_id.index);
        *self.last_purged_log_id.write().await = Some(log_id);

        log_file
            .rewrite(Some(log_id), log.values())
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        debug!(upto = log_id.index, remaining = log.len(), "Compacted raft log");
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MetadataResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => responses.push(MetadataResponse::Ok),
                EntryPayload::Normal(command) => {
                    responses.push(self.sm.apply_command(command.clone()));
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(MetadataResponse::Ok);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();

        self.sm
            .restore(&data)
            .map_err(|e| storage_error(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        let snapshot = self.cached_snapshot.read().await;
        Ok(snapshot.as_ref().map(|cached| Snapshot {
            meta: cached.meta.clone(),
            snapshot: Box::new(Cursor::new(cached.data.clone())),
        }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        // Hold the applied id while serializing so both describe the same state.
        let last_applied_guard = self.last_applied_log.read().await;
        let data = self
            .sm
            .snapshot()
            .map_err(|e| storage_error(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;
        let last_applied = *last_applied_guard;
        drop(last_applied_guard);
        let membership = self.last_membership.read().await.clone();

        let snapshot_id = format!(
            "snapshot-{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            uuid::Uuid::new_v4().simple()
        );
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.persist_snapshot(&meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}
