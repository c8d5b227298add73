//! Partition replication.
//!
//! Each hosted partition runs exactly one replication task matching its
//! local role:
//!
//! - **Leader** ([`spawn_leader`]): tracks how far every follower has
//!   fetched, advances the high watermark to the minimum log end offset over
//!   the ISR and proposes ISR shrinks and expansions through the metadata
//!   store.
//! - **Follower** ([`spawn_follower`]): pulls batches from the leader with
//!   `ReplicaFetch` RPCs, appends them with the leader's offsets and follows
//!   the leader's high watermark.
//!
//! The fetch offset a follower sends is its log end offset, so every fetch
//! doubles as an acknowledgement of everything before it.

mod follower;
mod leader;

use async_trait::async_trait;

pub use follower::{FollowerHandle, FollowerParams, spawn_follower};
pub use leader::{LeaderEvent, LeaderHandle, LeaderParams, spawn_leader};

use super::error::ClusterResult;
use super::metadata_store::MetadataStore;
use super::raft::{MetadataCommand, MetadataResponse};
use crate::cluster::error::ClusterError;

/// Where a partition leader sends ISR changes.
#[async_trait]
pub trait IsrProposer: Send + Sync {
    /// Propose `isr` for the partition, fenced by `leader_epoch`. Returns the
    /// ISR as committed.
    async fn propose_isr(
        &self,
        topic: &str,
        partition: i32,
        leader_epoch: i32,
        isr: Vec<i32>,
    ) -> ClusterResult<Vec<i32>>;
}

#[async_trait]
impl IsrProposer for MetadataStore {
    async fn propose_isr(
        &self,
        topic: &str,
        partition: i32,
        leader_epoch: i32,
        isr: Vec<i32>,
    ) -> ClusterResult<Vec<i32>> {
        let command = MetadataCommand::UpdateIsr {
            topic: topic.to_string(),
            partition,
            leader_epoch,
            isr,
        };
        match self.propose_forwarded(command).await? {
            MetadataResponse::IsrUpdated { isr } => Ok(isr),
            MetadataResponse::Rejected(e) => Err(e.into()),
            other => Err(ClusterError::Raft(format!(
                "unexpected response to ISR update: {other:?}"
            ))),
        }
    }
}
