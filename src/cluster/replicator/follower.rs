//! Follower-side replication task.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use num_traits::FromPrimitive;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::log::{LogError, PartitionLog};
use crate::cluster::raft::{
    ReplicaFetchRequest, ReplicaFetchResponse, RpcClient, RpcMessage, RpcResponse,
};
use crate::error::KafkaCode;

#[derive(Debug, Clone)]
pub struct FollowerParams {
    pub topic: Arc<str>,
    pub partition: i32,
    pub local_id: i32,
    pub leader_id: i32,
    /// Cluster RPC address of the leader broker.
    pub leader_rpc_addr: String,
    pub fetch_max_bytes: usize,
    pub fetch_wait_max: Duration,
    pub backoff: Duration,
    pub rpc_timeout: Duration,
}

pub struct FollowerHandle {
    leader_id: i32,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    pub fn leader_id(&self) -> i32 {
        self.leader_id
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Start pulling the partition from its leader.
pub fn spawn_follower(params: FollowerParams, log: Arc<PartitionLog>) -> FollowerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let leader_id = params.leader_id;
    let task = tokio::spawn(run(params, log, shutdown_rx));
    FollowerHandle {
        leader_id,
        shutdown: shutdown_tx,
        task,
    }
}

/// What one fetch round did.
#[derive(Debug, PartialEq, Eq)]
enum FetchOutcome {
    /// Records were appended; fetch again immediately.
    Progress,
    /// Nothing new on the leader.
    Idle,
    /// The round failed; back off before the next one.
    Retry,
}

async fn run(params: FollowerParams, log: Arc<PartitionLog>, mut shutdown: oneshot::Receiver<()>) {
    // The leader may hold the request for up to `fetch_wait_max`.
    let client = RpcClient::new(
        params.leader_rpc_addr.clone(),
        params.rpc_timeout + params.fetch_wait_max,
    );
    info!(
        topic = %params.topic,
        partition = params.partition,
        leader = params.leader_id,
        leader_addr = %params.leader_rpc_addr,
        log_end_offset = log.log_end_offset(),
        "Follower replication started"
    );

    loop {
        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = fetch_once(&params, &client, &log) => outcome,
        };
        if outcome == FetchOutcome::Retry {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(params.backoff) => {}
            }
        }
    }
    debug!(
        topic = %params.topic,
        partition = params.partition,
        "Follower replication stopped"
    );
}

async fn fetch_once(
    params: &FollowerParams,
    client: &RpcClient,
    log: &PartitionLog,
) -> FetchOutcome {
    let fetch_offset = log.log_end_offset();
    let request = RpcMessage::ReplicaFetch(ReplicaFetchRequest {
        topic: params.topic.to_string(),
        partition: params.partition,
        replica_id: params.local_id,
        fetch_offset,
        max_bytes: params.fetch_max_bytes,
        max_wait_ms: params.fetch_wait_max.as_millis() as u64,
    });
    let response = match client.call(&request).await {
        Ok(RpcResponse::ReplicaFetch(response)) => response,
        Ok(RpcResponse::Error(e)) => {
            debug!(topic = %params.topic, partition = params.partition, error = %e.message, "Replica fetch rejected");
            return FetchOutcome::Retry;
        }
        Ok(other) => {
            warn!(topic = %params.topic, partition = params.partition, response = ?other, "Unexpected replica fetch response");
            return FetchOutcome::Retry;
        }
        Err(e) => {
            debug!(
                topic = %params.topic,
                partition = params.partition,
                leader_addr = %params.leader_rpc_addr,
                error = %e,
                "Replica fetch failed"
            );
            return FetchOutcome::Retry;
        }
    };
    apply_response(params, log, fetch_offset, response).await
}

async fn apply_response(
    params: &FollowerParams,
    log: &PartitionLog,
    fetch_offset: i64,
    response: ReplicaFetchResponse,
) -> FetchOutcome {
    match KafkaCode::from_i16(response.error_code).unwrap_or(KafkaCode::Unknown) {
        KafkaCode::None => {}
        KafkaCode::OffsetOutOfRange if fetch_offset > response.log_end_offset => {
            // Holding records the leader never committed: drop them.
            warn!(
                topic = %params.topic,
                partition = params.partition,
                local_leo = fetch_offset,
                leader_leo = response.log_end_offset,
                "Truncating divergent suffix to leader log end offset"
            );
            return match log.truncate(response.log_end_offset).await {
                Ok(_) => FetchOutcome::Progress,
                Err(e) => {
                    warn!(topic = %params.topic, partition = params.partition, error = %e, "Truncation failed");
                    FetchOutcome::Retry
                }
            };
        }
        code => {
            debug!(
                topic = %params.topic,
                partition = params.partition,
                error_code = ?code,
                "Leader answered replica fetch with an error"
            );
            return FetchOutcome::Retry;
        }
    }

    let appended = !response.records.is_empty();
    if appended {
        match log.append_replicated(Bytes::from(response.records)).await {
            Ok(info) => debug!(
                topic = %params.topic,
                partition = params.partition,
                base_offset = info.base_offset,
                next_offset = info.next_offset,
                "Replicated records"
            ),
            Err(LogError::NonContiguous { expected, actual }) => {
                warn!(
                    topic = %params.topic,
                    partition = params.partition,
                    expected,
                    actual,
                    "Leader returned records that do not continue the local log"
                );
                return FetchOutcome::Retry;
            }
            Err(e) => {
                warn!(topic = %params.topic, partition = params.partition, error = %e, "Failed to append replicated records");
                return FetchOutcome::Retry;
            }
        }
    }

    let hw = response.high_watermark.min(log.log_end_offset());
    log.update_high_watermark(hw);

    if appended {
        FetchOutcome::Progress
    } else {
        FetchOutcome::Idle
    }
}
