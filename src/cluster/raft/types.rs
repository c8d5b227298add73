//! Type definitions for the Raft consensus layer.

use openraft::BasicNode;
use std::io::Cursor;

use super::commands::{MetadataCommand, MetadataResponse};

/// Node ID type for Raft nodes. Equal to the broker id.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = MetadataCommand,
        R = MetadataResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Raft node id for a broker id. Broker ids are validated non-negative.
pub fn node_id_for(broker_id: i32) -> RaftNodeId {
    broker_id.max(0) as RaftNodeId
}
