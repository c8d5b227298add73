//! Raft consensus layer for cluster metadata.
//!
//! Every broker runs a raft node. Committed [`MetadataCommand`]s are applied
//! in log order to the [`MetadataStateMachine`], which holds:
//!
//! - registered brokers and their addresses
//! - topics with their partition count and replication factor
//! - per-partition replicas, leader, ISR and leader epoch
//!
//! # Architecture
//!
//! ```text
//!   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!   │  Broker 0   │    │  Broker 1   │    │  Broker 2   │
//!   │  (Leader)   │◄──►│ (Follower)  │◄──►│ (Follower)  │
//!   │ ┌─────────┐ │    │ ┌─────────┐ │    │ ┌─────────┐ │
//!   │ │RaftNode │ │    │ │RaftNode │ │    │ │RaftNode │ │
//!   │ └────┬────┘ │    │ └────┬────┘ │    │ └────┬────┘ │
//!   │ ┌────▼────┐ │    │ ┌────▼────┐ │    │ ┌────▼────┐ │
//!   │ │Metadata │ │    │ │Metadata │ │    │ │Metadata │ │
//!   │ │  FSM    │ │    │ │  FSM    │ │    │ │  FSM    │ │
//!   │ └─────────┘ │    │ └─────────┘ │    │ └─────────┘ │
//!   └─────────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! Durable state lives in `<raftdir>/raft.log`, `<raftdir>/vote` and
//! snapshots under `<raftdir>/snapshots/`. The same RPC transport also
//! carries follower fetches for partition replication.

mod commands;
mod config;
mod log_file;
mod network;
mod node;
mod state_machine;
mod storage;
mod types;

pub use commands::{MetadataCommand, MetadataError, MetadataResponse};
pub use config::RaftConfig;
pub use network::{
    RaftNetworkFactoryImpl, ReplicaFetchRequest, ReplicaFetchResponse, ReplicaFetchService,
    RpcClient, RpcErrorInfo, RpcErrorKind, RpcMessage, RpcResponse, forward_client_write,
};
pub use node::{RaftNode, SNAPSHOT_PREFIX};
pub use state_machine::{
    BrokerInfo, MetadataState, MetadataStateMachine, PartitionInfo, TopicInfo, assign_replicas,
};
pub use storage::RaftStore;
pub use types::{RaftNodeId, TypeConfig, node_id_for};
