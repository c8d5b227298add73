//! Error types for the cluster layer.
//!
//! # Error Handling Patterns
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure means the node cannot safely continue:
//! - Opening partition logs (corruption is fatal at startup)
//! - Replaying the consensus log
//! - Binding listeners
//!
//! ## Retry (Transient Coordination)
//!
//! `NotLeader`, `NoLeader`, `ProposalTimeout` and RPC failures are retried by
//! the issuing component (controller, replicator, forwarded proposals). See
//! [`ClusterError::is_retriable`].
//!
//! ## Client-Visible
//!
//! Everything that reaches a request handler is mapped to a wire error code
//! with [`ClusterError::to_kafka_code`]. The connection stays open.

use thiserror::Error;

use super::log::LogError;
use super::raft::MetadataError;
use crate::error::KafkaCode;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// This node is not the consensus leader. Carries the leader if known.
    #[error("not the metadata leader (leader: {leader_id:?} at {leader_addr:?})")]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    /// No consensus leader is currently elected.
    #[error("no metadata leader elected")]
    NoLeader,

    /// A proposal was not committed within the configured timeout.
    #[error("proposal timed out")]
    ProposalTimeout,

    /// Rejected by the metadata state machine.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Consensus engine failure.
    #[error("raft error: {0}")]
    Raft(String),

    #[error("partition {topic}/{partition} not found")]
    PartitionNotFound { topic: String, partition: i32 },

    /// This broker does not lead the partition.
    #[error("broker is not the leader for {topic}/{partition} (leader: {leader})")]
    NotLeaderForPartition {
        topic: String,
        partition: i32,
        leader: i32,
    },

    /// The partition currently has no leader.
    #[error("partition {topic}/{partition} has no leader")]
    LeaderNotAvailable { topic: String, partition: i32 },

    #[error("illegal topic name: {0}")]
    InvalidTopic(String),

    #[error("in-sync replicas {isr} below minimum {required}")]
    NotEnoughReplicas { isr: usize, required: usize },

    #[error("invalid required acks {0}")]
    InvalidRequiredAcks(i16),

    #[error("request timed out")]
    RequestTimedOut,

    /// Partition log failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Cluster RPC transport failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Failure in the gossip layer.
    #[error("membership error: {0}")]
    Membership(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Convert this error to the Kafka error code sent to clients.
    ///
    /// | ClusterError                       | KafkaCode                 |
    /// |------------------------------------|---------------------------|
    /// | NotLeader / NoLeader               | NotController             |
    /// | NotLeaderForPartition              | NotLeaderForPartition     |
    /// | LeaderNotAvailable                 | LeaderNotAvailable        |
    /// | PartitionNotFound                  | UnknownTopicOrPartition   |
    /// | Metadata(..)                       | per [`MetadataError`]     |
    /// | Log(OffsetOutOfRange)              | OffsetOutOfRange          |
    /// | Log(InvalidRecords)                | CorruptMessage            |
    /// | ProposalTimeout / RequestTimedOut  | RequestTimedOut           |
    /// | everything else                    | Unknown                   |
    pub fn to_kafka_code(&self) -> KafkaCode {
        match self {
            ClusterError::NotLeader { .. } | ClusterError::NoLeader => KafkaCode::NotController,
            ClusterError::NotLeaderForPartition { .. } => KafkaCode::NotLeaderForPartition,
            ClusterError::LeaderNotAvailable { .. } => KafkaCode::LeaderNotAvailable,
            ClusterError::PartitionNotFound { .. } => KafkaCode::UnknownTopicOrPartition,
            ClusterError::Metadata(e) => e.to_kafka_code(),
            ClusterError::InvalidTopic(_) => KafkaCode::InvalidTopic,
            ClusterError::NotEnoughReplicas { .. } => KafkaCode::NotEnoughReplicas,
            ClusterError::InvalidRequiredAcks(_) => KafkaCode::InvalidRequiredAcks,
            ClusterError::ProposalTimeout | ClusterError::RequestTimedOut => {
                KafkaCode::RequestTimedOut
            }
            ClusterError::Log(e) => e.to_kafka_code(),
            ClusterError::ShuttingDown => KafkaCode::BrokerNotAvailable,
            ClusterError::Raft(_)
            | ClusterError::Rpc(_)
            | ClusterError::Membership(_)
            | ClusterError::ObjectStore(_)
            | ClusterError::Serde(_)
            | ClusterError::Io(_)
            | ClusterError::Config(_) => KafkaCode::Unknown,
        }
    }

    /// Whether this error indicates this node should not handle the request and
    /// the caller should locate the current leader.
    #[inline]
    pub fn is_not_leader(&self) -> bool {
        matches!(
            self,
            ClusterError::NotLeader { .. }
                | ClusterError::NoLeader
                | ClusterError::NotLeaderForPartition { .. }
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::NotLeader { .. }
            | ClusterError::NoLeader
            | ClusterError::ProposalTimeout
            | ClusterError::Raft(_)
            | ClusterError::Rpc(_)
            | ClusterError::RequestTimedOut
            | ClusterError::LeaderNotAvailable { .. }
            | ClusterError::NotEnoughReplicas { .. } => true,
            ClusterError::Io(e) => is_io_error_retryable(e),
            ClusterError::Metadata(_)
            | ClusterError::PartitionNotFound { .. }
            | ClusterError::NotLeaderForPartition { .. }
            | ClusterError::InvalidTopic(_)
            | ClusterError::InvalidRequiredAcks(_)
            | ClusterError::Log(_)
            | ClusterError::Membership(_)
            | ClusterError::ObjectStore(_)
            | ClusterError::Serde(_)
            | ClusterError::Config(_)
            | ClusterError::ShuttingDown => false,
        }
    }
}

fn is_io_error_retryable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_maps_to_not_controller() {
        let err = ClusterError::NotLeader {
            leader_id: Some(2),
            leader_addr: Some("10.0.0.2:9093".into()),
        };
        assert_eq!(err.to_kafka_code(), KafkaCode::NotController);
        assert!(err.is_not_leader());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_metadata_errors_keep_their_codes() {
        let err: ClusterError = MetadataError::TopicAlreadyExists("orders".into()).into();
        assert_eq!(err.to_kafka_code(), KafkaCode::TopicAlreadyExists);
        assert!(!err.is_retriable());

        let err: ClusterError = MetadataError::InvalidReplicationFactor {
            requested: 4,
            available: 3,
        }
        .into();
        assert_eq!(err.to_kafka_code(), KafkaCode::InvalidReplicationFactor);
    }

    #[test]
    fn test_partition_errors() {
        let err = ClusterError::NotLeaderForPartition {
            topic: "t".into(),
            partition: 0,
            leader: 3,
        };
        assert_eq!(err.to_kafka_code(), KafkaCode::NotLeaderForPartition);
        assert!(!err.is_retriable());

        let err = ClusterError::PartitionNotFound {
            topic: "t".into(),
            partition: 9,
        };
        assert_eq!(err.to_kafka_code(), KafkaCode::UnknownTopicOrPartition);
    }

    #[test]
    fn test_log_errors_map_through() {
        let err: ClusterError = LogError::OffsetOutOfRange {
            offset: 5,
            log_start: 10,
            log_end: 20,
        }
        .into();
        assert_eq!(err.to_kafka_code(), KafkaCode::OffsetOutOfRange);
    }

    #[test]
    fn test_io_retry_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(ClusterError::Io(refused).is_retriable());
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!ClusterError::Io(denied).is_retriable());
    }

    #[test]
    fn test_into_crate_error() {
        let err: crate::error::Error = ClusterError::Config("bad port".into()).into();
        assert_eq!(err, crate::error::Error::Config("bad port".into()));
    }
}
