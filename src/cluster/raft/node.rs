//! Raft node wrapper providing a simpler interface.
//!
//! This module wraps the openraft Raft node and the cluster RPC server and
//! exposes the operations the metadata store and controller need.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use object_store::ObjectStore;
use openraft::error::{ClientWriteError, ForwardToLeader, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{MetadataCommand, MetadataResponse};
use super::config::RaftConfig;
use super::network::{RaftNetworkFactoryImpl, ReplicaFetchService, RpcHandlers, RpcServer};
use super::state_machine::MetadataStateMachine;
use super::storage::RaftStore;
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::metrics;

/// Object store prefix for metadata snapshots, relative to the store root.
pub const SNAPSHOT_PREFIX: &str = "snapshots";

/// Proposals allowed in flight at once; further callers wait for a slot.
const MAX_PENDING_PROPOSALS: usize = 1024;

type ClientWriteRaftError = RaftError<RaftNodeId, ClientWriteError<RaftNodeId, BasicNode>>;

fn not_leader(forward: &ForwardToLeader<RaftNodeId, BasicNode>) -> ClusterError {
    ClusterError::NotLeader {
        leader_id: forward.leader_id,
        leader_addr: forward.leader_node.as_ref().map(|n| n.addr.clone()),
    }
}

fn map_write_error(e: ClientWriteRaftError) -> ClusterError {
    match e.forward_to_leader::<BasicNode>() {
        Some(forward) => not_leader(forward),
        None => ClusterError::Raft(e.to_string()),
    }
}

/// Propose `command` on the local raft instance and wait for it to apply.
///
/// A non-leader fails with [`ClusterError::NotLeader`] naming the leader if
/// one is known.
pub(super) async fn client_write(
    raft: &Raft<TypeConfig>,
    command: MetadataCommand,
    proposal_timeout: Duration,
) -> ClusterResult<MetadataResponse> {
    match timeout(proposal_timeout, raft.client_write(command)).await {
        Ok(Ok(response)) => Ok(response.data),
        Ok(Err(e)) => Err(map_write_error(e)),
        Err(_) => Err(ClusterError::ProposalTimeout),
    }
}

/// A Raft node for cluster metadata.
pub struct RaftNode {
    raft: Raft<TypeConfig>,
    state_machine: MetadataStateMachine,
    handlers: Arc<RpcHandlers>,
    node_id: RaftNodeId,
    /// Address peers reach this node's RPC server at.
    rpc_addr: String,
    config: RaftConfig,
    shutdown_tx: broadcast::Sender<()>,
    proposal_semaphore: Semaphore,
}

impl RaftNode {
    /// Open durable raft state, start the engine and the RPC server.
    ///
    /// `object_store` holds snapshots under [`SNAPSHOT_PREFIX`]. A corrupt
    /// log, vote or snapshot fails startup.
    pub async fn new(config: RaftConfig, object_store: Arc<dyn ObjectStore>) -> ClusterResult<Self> {
        let errors = config.errors();
        if !errors.is_empty() {
            return Err(ClusterError::Config(format!(
                "invalid raft config: {}",
                errors.join("; ")
            )));
        }

        let openraft_config = config.to_openraft_config()?;
        let store = RaftStore::open(&config.raft_dir, object_store, SNAPSHOT_PREFIX)?;
        let restored = store
            .load_snapshot_from_store()
            .await
            .map_err(|e| ClusterError::Raft(format!("failed to load snapshot: {e}")))?;
        if restored {
            info!(node_id = config.node_id, "Restored metadata from snapshot");
        }

        let state_machine = store.state_machine();
        let network = RaftNetworkFactoryImpl::new(config.rpc_timeout);
        let (log_store, sm_store) = Adaptor::new(store);
        let raft = Raft::new(
            config.node_id,
            openraft_config,
            network,
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| ClusterError::Raft(format!("failed to create raft node: {e}")))?;

        let handlers = Arc::new(RpcHandlers::new(raft.clone(), config.proposal_timeout));
        let server = RpcServer::bind(&config.rpc_addr, handlers.clone()).await?;
        let rpc_addr = advertised_addr(&config.rpc_addr, server.local_addr()?.port());

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(server.run(shutdown_tx.subscribe()));

        info!(
            node_id = config.node_id,
            rpc_addr = %rpc_addr,
            raft_dir = %config.raft_dir.display(),
            "Raft node started"
        );

        Ok(Self {
            raft,
            state_machine,
            handlers,
            node_id: config.node_id,
            rpc_addr,
            config,
            shutdown_tx,
            proposal_semaphore: Semaphore::new(MAX_PENDING_PROPOSALS),
        })
    }

    /// Bootstrap a single-voter cluster made of this node. Other nodes join
    /// later as learners and are then promoted.
    pub async fn initialize_cluster(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.rpc_addr.clone(),
            },
        );
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ClusterError::Raft(format!("failed to initialize cluster: {e}")))?;
        info!(node_id = self.node_id, "Initialized single-node metadata cluster");
        Ok(())
    }

    /// Add a node as a learner and wait until it has caught up.
    pub async fn add_learner(&self, node_id: RaftNodeId, addr: String) -> ClusterResult<()> {
        self.raft
            .add_learner(node_id, BasicNode { addr: addr.clone() }, true)
            .await
            .map_err(map_write_error)?;
        info!(node_id, addr = %addr, "Added raft learner");
        Ok(())
    }

    /// Replace the voter set. Nodes dropped from it stay learners.
    pub async fn change_membership(&self, voters: BTreeSet<RaftNodeId>) -> ClusterResult<()> {
        self.raft
            .change_membership(voters.clone(), true)
            .await
            .map_err(map_write_error)?;
        info!(voters = ?voters, "Changed raft voters");
        Ok(())
    }

    /// Remove nodes from the cluster entirely, voters and learners alike.
    pub async fn remove_nodes(&self, nodes: BTreeSet<RaftNodeId>) -> ClusterResult<()> {
        let voters: BTreeSet<RaftNodeId> = self
            .voter_ids()
            .into_iter()
            .filter(|id| !nodes.contains(id))
            .collect();
        if voters.is_empty() {
            return Err(ClusterError::Config(
                "refusing to remove every raft voter".to_string(),
            ));
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;
        info!(removed = ?nodes, "Removed raft members");
        Ok(())
    }

    /// Propose a command through the local raft instance.
    ///
    /// Waits at most `proposal_timeout` for a proposal slot and again for
    /// commit. Non-leaders fail with [`ClusterError::NotLeader`].
    pub async fn client_write(&self, command: MetadataCommand) -> ClusterResult<MetadataResponse> {
        let _permit = match timeout(
            self.config.proposal_timeout,
            self.proposal_semaphore.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClusterError::ShuttingDown),
            Err(_) => {
                metrics::record_raft_proposal("backpressure", 0.0);
                return Err(ClusterError::ProposalTimeout);
            }
        };

        let kind = command.kind();
        let start = Instant::now();
        let result = client_write(&self.raft, command, self.config.proposal_timeout).await;
        let status = match &result {
            Ok(_) => "success",
            Err(ClusterError::NotLeader { .. }) => "not_leader",
            Err(ClusterError::ProposalTimeout) => "timeout",
            Err(_) => "error",
        };
        metrics::record_raft_proposal(status, start.elapsed().as_secs_f64());
        debug!(command = kind, status, "Metadata proposal finished");
        result
    }

    /// Confirm leadership with a quorum so local reads are linearizable.
    pub async fn ensure_linearizable(&self) -> ClusterResult<()> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => Ok(()),
            Err(e) => match e.forward_to_leader::<BasicNode>() {
                Some(forward) => Err(not_leader(forward)),
                None => Err(ClusterError::Raft(e.to_string())),
            },
        }
    }

    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// RPC address of the current leader, from the membership config.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// Wait until some node is leader.
    pub async fn wait_for_leader(&self, within: Duration) -> ClusterResult<RaftNodeId> {
        let mut metrics = self.raft.metrics();
        let wait = async {
            loop {
                if let Some(leader) = metrics.borrow().current_leader {
                    return Ok(leader);
                }
                if metrics.changed().await.is_err() {
                    return Err(ClusterError::ShuttingDown);
                }
            }
        };
        timeout(within, wait).await.map_err(|_| ClusterError::NoLeader)?
    }

    pub fn voter_ids(&self) -> BTreeSet<RaftNodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    pub fn learner_ids(&self) -> BTreeSet<RaftNodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .learner_ids()
            .collect()
    }

    /// Whether the cluster has a membership, either from a previous run or
    /// from joining. Checked before [`RaftNode::initialize_cluster`].
    pub fn is_initialized(&self) -> bool {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    /// The state machine for local reads. Followers may lag the leader.
    pub fn state_machine(&self) -> &MetadataStateMachine {
        &self.state_machine
    }

    /// Serve `ReplicaFetch` RPCs with `service`.
    pub fn set_replica_service(&self, service: Arc<dyn ReplicaFetchService>) {
        self.handlers.set_replica_service(service);
    }

    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn metrics(&self) -> openraft::RaftMetrics<RaftNodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Stop the RPC server and the raft engine.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let _ = self.shutdown_tx.send(());
        self.proposal_semaphore.close();
        if let Err(e) = self.raft.shutdown().await {
            warn!(node_id = self.node_id, error = %e, "Raft shutdown reported an error");
            return Err(ClusterError::Raft(format!("failed to shut down raft: {e}")));
        }
        info!(node_id = self.node_id, "Raft node shut down");
        Ok(())
    }
}

/// Replace a zero port in `configured` with the port actually bound.
fn advertised_addr(configured: &str, bound_port: u16) -> String {
    match configured.rsplit_once(':') {
        Some((host, "0")) => format!("{host}:{bound_port}"),
        _ => configured.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::BrokerInfo;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> RaftConfig {
        RaftConfig {
            node_id: 1,
            raft_dir: dir.path().join("raft"),
            rpc_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn broker(id: i32) -> MetadataCommand {
        MetadataCommand::RegisterBroker(BrokerInfo {
            id,
            host: "127.0.0.1".to_string(),
            port: 9092,
            rpc_addr: "127.0.0.1:9093".to_string(),
            voter: true,
        })
    }

    #[test]
    fn test_advertised_addr() {
        assert_eq!(advertised_addr("127.0.0.1:0", 4242), "127.0.0.1:4242");
        assert_eq!(advertised_addr("10.0.0.1:9093", 4242), "10.0.0.1:9093");
    }

    #[tokio::test]
    async fn test_single_node_proposals_apply() {
        let dir = TempDir::new().unwrap();
        let node = RaftNode::new(test_config(&dir), Arc::new(InMemory::new()))
            .await
            .unwrap();
        assert!(!node.is_initialized());
        node.initialize_cluster().await.unwrap();
        assert_eq!(node.wait_for_leader(Duration::from_secs(5)).await.unwrap(), 1);
        assert!(node.is_leader());
        assert_eq!(node.leader_addr().as_deref(), Some(node.rpc_addr()));

        node.client_write(broker(1)).await.unwrap();
        let resp = node
            .client_write(MetadataCommand::CreateTopic {
                name: "orders".to_string(),
                partitions: 2,
                replication_factor: 1,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            MetadataResponse::TopicCreated {
                name: "orders".to_string(),
                partitions: 2
            }
        );
        node.ensure_linearizable().await.unwrap();

        let state = node.state_machine().current();
        assert_eq!(state.topic("orders").map(|t| t.partitions.len()), Some(2));
        assert_eq!(state.partition("orders", 1).map(|p| p.leader), Some(1));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_committed_log() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        {
            let node = RaftNode::new(test_config(&dir), store.clone()).await.unwrap();
            node.initialize_cluster().await.unwrap();
            node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
            node.client_write(broker(1)).await.unwrap();
            node.shutdown().await.unwrap();
        }

        let node = RaftNode::new(test_config(&dir), store).await.unwrap();
        assert!(node.is_initialized());
        node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        let mut rx = node.state_machine().subscribe();
        let restored = timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow().broker(1).is_some() {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await;
        assert!(restored.is_ok(), "broker registration was not replayed");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_before_initialize_is_rejected() {
        let dir = TempDir::new().unwrap();
        let node = RaftNode::new(test_config(&dir), Arc::new(InMemory::new()))
            .await
            .unwrap();
        let err = node.client_write(broker(1)).await.unwrap_err();
        assert!(err.is_retriable(), "unexpected error {err:?}");
        node.shutdown().await.unwrap();
    }
}
