//! Consensus-backed cluster metadata.
//!
//! [`MetadataStore`] is the only way the rest of the broker touches
//! metadata: writes go through [`MetadataStore::propose`] (local leader only)
//! or [`MetadataStore::propose_forwarded`] (any node), reads clone an `Arc`
//! snapshot of the applied state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::error::{ClusterError, ClusterResult};
use super::raft::{
    MetadataCommand, MetadataResponse, MetadataState, RaftNode, forward_client_write,
};
use super::retry;

/// Immutable view of the metadata at some applied version.
pub type MetadataSnapshot = Arc<MetadataState>;

pub struct MetadataStore {
    node: Arc<RaftNode>,
}

impl MetadataStore {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Propose on this node. Fails with [`ClusterError::NotLeader`] unless
    /// this node is the raft leader.
    pub async fn propose(&self, command: MetadataCommand) -> ClusterResult<MetadataResponse> {
        self.node.client_write(command).await
    }

    /// Propose from any node: forwards to the raft leader over the cluster
    /// RPC transport, retrying elections and leader moves with backoff.
    pub async fn propose_forwarded(
        &self,
        command: MetadataCommand,
    ) -> ClusterResult<MetadataResponse> {
        let retries = self.node.config().forward_retries.saturating_sub(1);
        retry::with_policy(
            "proposal",
            retry::proposal_policy(retries),
            || self.try_propose_forwarded(command.clone()),
            ClusterError::is_retriable,
        )
        .await
    }

    async fn try_propose_forwarded(
        &self,
        command: MetadataCommand,
    ) -> ClusterResult<MetadataResponse> {
        match self.node.client_write(command.clone()).await {
            Err(ClusterError::NotLeader {
                leader_id,
                leader_addr,
            }) => {
                let addr = leader_addr.or_else(|| self.node.leader_addr());
                match (leader_id, addr) {
                    (Some(leader), Some(addr)) if leader != self.node.node_id() => {
                        debug!(
                            leader,
                            leader_addr = %addr,
                            command = command.kind(),
                            "Forwarding proposal to raft leader"
                        );
                        forward_client_write(&addr, command, self.node.config().rpc_timeout)
                            .await
                    }
                    _ => Err(ClusterError::NoLeader),
                }
            }
            other => other,
        }
    }

    /// The latest applied metadata.
    pub fn read(&self) -> MetadataSnapshot {
        self.node.state_machine().current()
    }

    /// Watch applied metadata; fires after every committed command.
    pub fn subscribe(&self) -> watch::Receiver<MetadataSnapshot> {
        self.node.state_machine().subscribe()
    }

    /// Broker id of the raft leader, or -1 while none is known.
    pub fn controller_id(&self) -> i32 {
        self.node
            .current_leader()
            .and_then(|id| i32::try_from(id).ok())
            .unwrap_or(-1)
    }

    pub fn is_controller(&self) -> bool {
        self.node.is_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::{BrokerInfo, MetadataError, RaftConfig};
    use object_store::memory::InMemory;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn start_node(dir: &TempDir, id: u64) -> Arc<RaftNode> {
        let config = RaftConfig {
            node_id: id,
            raft_dir: dir.path().join(format!("raft-{id}")),
            rpc_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            forward_retries: 3,
            ..Default::default()
        };
        Arc::new(
            RaftNode::new(config, Arc::new(InMemory::new()))
                .await
                .unwrap(),
        )
    }

    fn register(id: i32) -> MetadataCommand {
        MetadataCommand::RegisterBroker(BrokerInfo {
            id,
            host: "127.0.0.1".to_string(),
            port: 9092 + id,
            rpc_addr: String::new(),
            voter: true,
        })
    }

    #[tokio::test]
    async fn test_propose_and_read() {
        let dir = TempDir::new().unwrap();
        let node = start_node(&dir, 1).await;
        node.initialize_cluster().await.unwrap();
        node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        let store = MetadataStore::new(node.clone());

        assert_eq!(store.controller_id(), 1);
        assert!(store.is_controller());

        let mut rx = store.subscribe();
        store.propose(register(1)).await.unwrap();
        rx.changed().await.unwrap();
        assert!(store.read().broker(1).is_some());

        let create = MetadataCommand::CreateTopic {
            name: "orders".to_string(),
            partitions: 3,
            replication_factor: 1,
        };
        store.propose(create.clone()).await.unwrap();
        let again = store.propose_forwarded(create).await.unwrap();
        assert_eq!(
            again.into_result(),
            Err(MetadataError::TopicAlreadyExists("orders".to_string()))
        );
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_forwards_to_leader() {
        let dir = TempDir::new().unwrap();
        let leader = start_node(&dir, 1).await;
        let follower = start_node(&dir, 2).await;
        leader.initialize_cluster().await.unwrap();
        leader.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        leader
            .add_learner(2, follower.rpc_addr().to_string())
            .await
            .unwrap();
        leader
            .change_membership([1, 2].into_iter().collect())
            .await
            .unwrap();

        let store = MetadataStore::new(follower.clone());
        let err = store.propose(register(2)).await.unwrap_err();
        assert!(err.is_not_leader());

        store.propose_forwarded(register(2)).await.unwrap();
        let mut rx = store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.borrow().broker(2).is_none() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(store.controller_id(), 1);

        follower.shutdown().await.unwrap();
        leader.shutdown().await.unwrap();
    }
}
