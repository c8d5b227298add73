//! Hosted partitions and their replication roles.
//!
//! The [`ReplicaManager`] owns every [`PartitionLog`] on this broker. A
//! watcher task follows committed metadata and, for each partition assigned
//! here, keeps exactly one replication task running that matches the local
//! role: a leader task when this broker leads the partition, a follower task
//! when another broker does. On every leadership change the replica first
//! truncates its log to its high watermark so that nothing uncommitted
//! survives the change.
//!
//! Client reads and writes go through [`ReplicaManager::append`],
//! [`ReplicaManager::fetch`] and [`ReplicaManager::list_offset`], which only
//! succeed on the partition leader. Follower fetches arrive over the cluster
//! RPC transport through the [`ReplicaFetchService`] implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{LogConfig, ReplicationConfig};
use super::error::{ClusterError, ClusterResult};
use super::log::{AppendInfo, LogError, PartitionLog, ReadResult};
use super::metadata_store::{MetadataSnapshot, MetadataStore};
use super::metrics;
use super::raft::{
    PartitionInfo, ReplicaFetchRequest, ReplicaFetchResponse, ReplicaFetchService, TopicInfo,
};
use super::replicator::{
    FollowerHandle, FollowerParams, IsrProposer, LeaderEvent, LeaderHandle, LeaderParams,
    spawn_follower, spawn_leader,
};
use crate::error::KafkaCode;

/// Offset sentinel for "latest" in ListOffsets.
pub const LATEST_TIMESTAMP: i64 = -1;
/// Offset sentinel for "earliest" in ListOffsets.
pub const EARLIEST_TIMESTAMP: i64 = -2;

enum Role {
    Leader(LeaderHandle),
    Follower {
        handle: FollowerHandle,
        leader_epoch: i32,
    },
    Offline,
}

impl Role {
    fn leader_epoch(&self) -> Option<i32> {
        match self {
            Role::Leader(handle) => Some(handle.leader_epoch()),
            Role::Follower { leader_epoch, .. } => Some(*leader_epoch),
            Role::Offline => None,
        }
    }

    async fn stop(self) {
        match self {
            Role::Leader(handle) => handle.stop().await,
            Role::Follower { handle, .. } => handle.stop().await,
            Role::Offline => {}
        }
    }
}

/// One partition replica hosted on this broker.
pub struct HostedPartition {
    topic: Arc<str>,
    partition: i32,
    /// `created_version` of the topic generation this replica belongs to.
    created_version: u64,
    log: Arc<PartitionLog>,
    role: Mutex<Role>,
}

impl HostedPartition {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn log(&self) -> &Arc<PartitionLog> {
        &self.log
    }

    pub fn is_leader(&self) -> bool {
        matches!(
            *self.role.lock().unwrap_or_else(PoisonError::into_inner),
            Role::Leader(_)
        )
    }

    /// Forward an event to the leader task. No-op unless leading.
    fn notify_leader(&self, event: LeaderEvent) {
        if let Role::Leader(handle) = &*self.role.lock().unwrap_or_else(PoisonError::into_inner) {
            handle.notify(event);
        }
    }

    fn take_role(&self) -> Role {
        std::mem::replace(
            &mut *self.role.lock().unwrap_or_else(PoisonError::into_inner),
            Role::Offline,
        )
    }

    fn set_role(&self, role: Role) {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner) = role;
    }

    fn current_epoch(&self) -> Option<i32> {
        self.role
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leader_epoch()
    }
}

/// Records and offsets returned to a consumer fetch.
#[derive(Debug, Clone)]
pub struct FetchedData {
    pub high_watermark: i64,
    pub log_start_offset: i64,
    /// Whole batches below the high watermark; empty when nothing is committed
    /// at the fetch offset yet.
    pub records: Bytes,
}

type PartitionMap = HashMap<String, BTreeMap<i32, Arc<HostedPartition>>>;

pub struct ReplicaManager {
    broker_id: i32,
    log_config: LogConfig,
    replication: ReplicationConfig,
    rpc_timeout: Duration,
    store: Arc<MetadataStore>,
    proposer: Arc<dyn IsrProposer>,
    partitions: RwLock<PartitionMap>,
    /// Serializes role transitions.
    reconcile_lock: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaManager {
    pub fn new(
        broker_id: i32,
        log_config: LogConfig,
        replication: ReplicationConfig,
        rpc_timeout: Duration,
        store: Arc<MetadataStore>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let proposer: Arc<dyn IsrProposer> = store.clone();
        Arc::new(Self {
            broker_id,
            log_config,
            replication,
            rpc_timeout,
            store,
            proposer,
            partitions: RwLock::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open every partition the current metadata assigns here, then keep
    /// roles in step with metadata in the background. Fails if a local log
    /// is corrupt.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        self.store.node().set_replica_service(self.clone());
        self.reconcile(&self.store.read()).await?;

        let watcher = {
            let manager = self.clone();
            let mut updates = self.store.subscribe();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        changed = updates.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let snapshot = updates.borrow_and_update().clone();
                            if let Err(e) = manager.reconcile(&snapshot).await {
                                error!(error = %e, version = snapshot.version, "Failed to apply partition roles");
                            }
                        }
                    }
                }
            })
        };

        let checkpointer = {
            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.replication.hw_checkpoint_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => manager.checkpoint_high_watermarks(),
                    }
                }
            })
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([watcher, checkpointer]);
        Ok(())
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    pub fn hosted(&self, topic: &str, partition: i32) -> Option<Arc<HostedPartition>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .and_then(|parts| parts.get(&partition))
            .cloned()
    }

    fn all_hosted(&self) -> Vec<Arc<HostedPartition>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|parts| parts.values().cloned())
            .collect()
    }

    /// The hosted partition, if this broker currently leads it.
    pub fn leader_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> ClusterResult<Arc<HostedPartition>> {
        let metadata = self.store.read();
        let info = metadata.partition(topic, partition).ok_or_else(|| {
            ClusterError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            }
        })?;
        if let Some(hosted) = self.hosted(topic, partition)
            && hosted.is_leader()
        {
            return Ok(hosted);
        }
        if info.has_leader() {
            Err(ClusterError::NotLeaderForPartition {
                topic: topic.to_string(),
                partition,
                leader: info.leader,
            })
        } else {
            Err(ClusterError::LeaderNotAvailable {
                topic: topic.to_string(),
                partition,
            })
        }
    }

    /// Append a produce batch on the leader.
    ///
    /// With `acks == -1` the ISR must hold at least `min_insync_replicas`
    /// members and the call returns once the high watermark covers the batch,
    /// or fails with [`ClusterError::RequestTimedOut`] after `timeout`.
    pub async fn append(
        &self,
        topic: &str,
        partition: i32,
        records: Bytes,
        acks: i16,
        timeout: Duration,
    ) -> ClusterResult<AppendInfo> {
        if !matches!(acks, -1..=1) {
            return Err(ClusterError::InvalidRequiredAcks(acks));
        }
        let hosted = self.leader_partition(topic, partition)?;
        if acks == -1 {
            let isr = self
                .store
                .read()
                .partition(topic, partition)
                .map_or(0, |p| p.isr.len());
            let required = self.replication.min_insync_replicas;
            if isr < required {
                return Err(ClusterError::NotEnoughReplicas { isr, required });
            }
        }

        let info = hosted.log.append(records).await?;
        hosted.notify_leader(LeaderEvent::Appended);
        metrics::record_produce(
            topic,
            partition,
            (info.next_offset - info.base_offset) as u64,
            0,
        );

        if acks == -1 {
            let mut hw = hosted.log.subscribe_high_watermark();
            let committed = hw.wait_for(|&hw| hw >= info.next_offset);
            match tokio::time::timeout(timeout, committed).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(ClusterError::ShuttingDown),
                Err(_) => {
                    debug!(
                        topic,
                        partition,
                        next_offset = info.next_offset,
                        high_watermark = hosted.log.high_watermark(),
                        "Produce timed out waiting for replication"
                    );
                    return Err(ClusterError::RequestTimedOut);
                }
            }
        }
        Ok(info)
    }

    /// Read committed records on the leader.
    ///
    /// Fetching at or beyond the high watermark waits up to `max_wait` for it
    /// to move and then returns no records without error.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: usize,
        max_wait: Duration,
    ) -> ClusterResult<FetchedData> {
        let hosted = self.leader_partition(topic, partition)?;
        let log = &hosted.log;
        let max_bytes = max_bytes.min(self.replication.max_fetch_response_size);
        let wait = max_wait.min(self.replication.fetch_max_wait);

        let mut records = read_committed(log, offset, max_bytes)?;
        if records.is_empty() && !wait.is_zero() {
            let mut hw = log.subscribe_high_watermark();
            if tokio::time::timeout(wait, hw.wait_for(|&hw| hw > offset))
                .await
                .is_ok()
            {
                records = read_committed(log, offset, max_bytes)?;
            }
        }
        metrics::record_fetch(topic, partition, records.len() as u64);
        Ok(FetchedData {
            high_watermark: log.high_watermark(),
            log_start_offset: log.log_start_offset(),
            records,
        })
    }

    /// Resolve a ListOffsets query on the leader.
    pub fn list_offset(&self, topic: &str, partition: i32, timestamp: i64) -> ClusterResult<i64> {
        let hosted = self.leader_partition(topic, partition)?;
        let log = &hosted.log;
        let hw = log.high_watermark();
        Ok(match timestamp {
            LATEST_TIMESTAMP => hw,
            EARLIEST_TIMESTAMP => log.log_start_offset(),
            ts => log.offset_for_timestamp(ts)?.map_or(hw, |offset| offset.min(hw)),
        })
    }

    /// Bring hosted partitions and their roles in line with `metadata`.
    async fn reconcile(&self, metadata: &MetadataSnapshot) -> ClusterResult<()> {
        let _guard = self.reconcile_lock.lock().await;

        let mut assigned: Vec<(&TopicInfo, &PartitionInfo)> = Vec::new();
        for topic in metadata.topics.values() {
            for info in &topic.partitions {
                if info.replicas.contains(&self.broker_id) {
                    assigned.push((topic, info));
                }
            }
        }

        let stale: Vec<Arc<HostedPartition>> = self
            .all_hosted()
            .into_iter()
            .filter(|hosted| {
                !assigned
                    .iter()
                    .any(|(t, p)| t.name == hosted.topic() && p.partition == hosted.partition)
            })
            .collect();
        for hosted in stale {
            self.remove_partition(&hosted).await;
        }

        let mut leaders = 0;
        let mut followers = 0;
        let mut under_replicated = 0;
        for (topic, info) in assigned {
            let hosted = self.open_partition(topic, info).await?;
            self.apply_role(&hosted, info, metadata).await;
            match (info.leader == self.broker_id, info.has_leader()) {
                (true, _) => {
                    leaders += 1;
                    if info.is_under_replicated() {
                        under_replicated += 1;
                    }
                }
                (false, true) => followers += 1,
                _ => {}
            }
        }
        metrics::set_partition_roles(leaders, followers, under_replicated);
        Ok(())
    }

    async fn open_partition(
        &self,
        topic_info: &TopicInfo,
        info: &PartitionInfo,
    ) -> ClusterResult<Arc<HostedPartition>> {
        let topic = topic_info.name.as_str();
        if let Some(hosted) = self.hosted(topic, info.partition) {
            if hosted.created_version == topic_info.created_version {
                return Ok(hosted);
            }
            info!(topic, partition = info.partition, "Replacing replica of a recreated topic");
            self.remove_partition(&hosted).await;
        }
        let log = PartitionLog::open(topic, info.partition, &self.log_config)?;
        info!(
            topic,
            partition = info.partition,
            log_start_offset = log.log_start_offset(),
            log_end_offset = log.log_end_offset(),
            high_watermark = log.high_watermark(),
            "Opened partition replica"
        );
        let hosted = Arc::new(HostedPartition {
            topic: Arc::from(topic),
            partition: info.partition,
            created_version: topic_info.created_version,
            log: Arc::new(log),
            role: Mutex::new(Role::Offline),
        });
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .insert(info.partition, hosted.clone());
        Ok(hosted)
    }

    async fn remove_partition(&self, hosted: &Arc<HostedPartition>) {
        {
            let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(parts) = partitions.get_mut(hosted.topic()) {
                parts.remove(&hosted.partition);
                if parts.is_empty() {
                    partitions.remove(hosted.topic());
                }
            }
        }
        hosted.take_role().stop().await;
        if let Err(e) = hosted.log.delete().await {
            warn!(topic = %hosted.topic, partition = hosted.partition, error = %e, "Failed to delete partition log");
        } else {
            info!(topic = %hosted.topic, partition = hosted.partition, "Removed partition replica");
        }
    }

    async fn apply_role(
        &self,
        hosted: &Arc<HostedPartition>,
        info: &PartitionInfo,
        metadata: &MetadataSnapshot,
    ) {
        let current_epoch = hosted.current_epoch();
        let leading = hosted.is_leader();

        if info.leader == self.broker_id {
            if leading && current_epoch == Some(info.leader_epoch) {
                hosted.notify_leader(LeaderEvent::IsrChanged {
                    isr: info.isr.clone(),
                    leader_epoch: info.leader_epoch,
                });
                return;
            }
            hosted.take_role().stop().await;
            self.truncate_to_high_watermark(hosted, "promoted").await;
            let params = LeaderParams {
                topic: hosted.topic.clone(),
                partition: info.partition,
                local_id: self.broker_id,
                replicas: info.replicas.clone(),
                isr: info.isr.clone(),
                leader_epoch: info.leader_epoch,
                lag_time_max: self.replication.replica_lag_time_max,
            };
            info!(
                topic = %hosted.topic,
                partition = info.partition,
                leader_epoch = info.leader_epoch,
                isr = ?info.isr,
                "Became partition leader"
            );
            let handle = spawn_leader(params, hosted.log.clone(), self.proposer.clone());
            hosted.set_role(Role::Leader(handle));
            return;
        }

        if !info.has_leader() {
            if current_epoch.is_some() {
                info!(topic = %hosted.topic, partition = info.partition, "Partition went offline");
            }
            hosted.take_role().stop().await;
            return;
        }

        if !leading && current_epoch == Some(info.leader_epoch) {
            return;
        }
        let Some(leader_addr) = metadata
            .broker(info.leader)
            .map(|b| b.rpc_addr.clone())
            .filter(|addr| !addr.is_empty())
        else {
            warn!(
                topic = %hosted.topic,
                partition = info.partition,
                leader = info.leader,
                "Leader has no known RPC address"
            );
            hosted.take_role().stop().await;
            return;
        };
        hosted.take_role().stop().await;
        self.truncate_to_high_watermark(hosted, if leading { "demoted" } else { "following" })
            .await;
        info!(
            topic = %hosted.topic,
            partition = info.partition,
            leader = info.leader,
            leader_epoch = info.leader_epoch,
            "Became partition follower"
        );
        let params = FollowerParams {
            topic: hosted.topic.clone(),
            partition: info.partition,
            local_id: self.broker_id,
            leader_id: info.leader,
            leader_rpc_addr: leader_addr,
            fetch_max_bytes: self.replication.replica_fetch_max_bytes,
            fetch_wait_max: self.replication.replica_fetch_wait_max,
            backoff: self.replication.replica_fetch_backoff,
            rpc_timeout: self.rpc_timeout,
        };
        let handle = spawn_follower(params, hosted.log.clone());
        hosted.set_role(Role::Follower {
            handle,
            leader_epoch: info.leader_epoch,
        });
    }

    async fn truncate_to_high_watermark(&self, hosted: &HostedPartition, reason: &str) {
        let log = &hosted.log;
        let hw = log.high_watermark();
        let leo = log.log_end_offset();
        if leo <= hw {
            return;
        }
        warn!(
            topic = %hosted.topic,
            partition = hosted.partition,
            high_watermark = hw,
            log_end_offset = leo,
            reason,
            "Truncating uncommitted suffix"
        );
        if let Err(e) = log.truncate(hw).await {
            error!(topic = %hosted.topic, partition = hosted.partition, error = %e, "Truncation failed");
        }
    }

    fn checkpoint_high_watermarks(&self) {
        for hosted in self.all_hosted() {
            if let Err(e) = hosted.log.checkpoint_high_watermark() {
                warn!(topic = %hosted.topic, partition = hosted.partition, error = %e, "Failed to checkpoint high watermark");
            }
        }
    }

    /// Stop replication, checkpoint high watermarks and close every log.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        let _guard = self.reconcile_lock.lock().await;
        let hosted = self.all_hosted();
        for partition in &hosted {
            partition.take_role().stop().await;
        }
        for partition in &hosted {
            if let Err(e) = partition.log.close().await {
                warn!(topic = %partition.topic, partition = partition.partition, error = %e, "Failed to close partition log");
            }
        }
        info!(partitions = hosted.len(), "Closed partition replicas");
    }
}

fn read_committed(log: &PartitionLog, offset: i64, max_bytes: usize) -> Result<Bytes, LogError> {
    match log.read(offset, max_bytes, log.high_watermark())? {
        ReadResult::Records(records) => Ok(records),
        ReadResult::NotYetAvailable => Ok(Bytes::new()),
    }
}

#[async_trait]
impl ReplicaFetchService for ReplicaManager {
    async fn replica_fetch(&self, request: ReplicaFetchRequest) -> ReplicaFetchResponse {
        let Some(hosted) = self.hosted(&request.topic, request.partition) else {
            metrics::record_replica_fetch("unknown_partition");
            return ReplicaFetchResponse::error(KafkaCode::UnknownTopicOrPartition);
        };
        if !hosted.is_leader() {
            metrics::record_replica_fetch("not_leader");
            return ReplicaFetchResponse::error(KafkaCode::NotLeaderForPartition);
        }
        let log = &hosted.log;
        let leo = log.log_end_offset();
        let log_start = log.log_start_offset();
        if request.fetch_offset > leo || request.fetch_offset < log_start {
            metrics::record_replica_fetch("out_of_range");
            return ReplicaFetchResponse {
                error_code: KafkaCode::OffsetOutOfRange as i16,
                high_watermark: log.high_watermark(),
                log_start_offset: log_start,
                log_end_offset: leo,
                records: Vec::new(),
            };
        }

        hosted.notify_leader(LeaderEvent::FollowerFetch {
            replica_id: request.replica_id,
            fetch_offset: request.fetch_offset,
        });

        if request.fetch_offset == leo && request.max_wait_ms > 0 {
            let mut leo_rx = log.subscribe_leo();
            let mut hw_rx = log.subscribe_high_watermark();
            let known_hw = *hw_rx.borrow_and_update();
            let offset = request.fetch_offset;
            let wait = Duration::from_millis(request.max_wait_ms);
            let _ = tokio::time::timeout(wait, async {
                tokio::select! {
                    _ = leo_rx.wait_for(|&leo| leo > offset) => {}
                    _ = hw_rx.wait_for(|&hw| hw != known_hw) => {}
                }
            })
            .await;
        }

        let max_bytes = request.max_bytes.min(self.replication.replica_fetch_max_bytes);
        let records = match log.read(request.fetch_offset, max_bytes, i64::MAX) {
            Ok(ReadResult::Records(records)) => records.to_vec(),
            Ok(ReadResult::NotYetAvailable) => Vec::new(),
            Err(e) => {
                metrics::record_replica_fetch("error");
                debug!(topic = %request.topic, partition = request.partition, error = %e, "Replica fetch read failed");
                return ReplicaFetchResponse::error(e.to_kafka_code());
            }
        };
        metrics::record_replica_fetch("ok");
        ReplicaFetchResponse {
            error_code: KafkaCode::None as i16,
            high_watermark: log.high_watermark(),
            log_start_offset: log.log_start_offset(),
            log_end_offset: log.log_end_offset(),
            records,
        }
    }
}
