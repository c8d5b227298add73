//! Raft commands and responses for cluster metadata.
//!
//! Commands are the inputs to the metadata state machine. They are
//! replicated via Raft and applied in log order on every node, so applying
//! the same sequence always yields the same state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::KafkaCode;

use super::state_machine::BrokerInfo;

/// Commands that can be applied to the metadata state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataCommand {
    /// Insert or refresh a broker. Offline partitions replicated on it
    /// elect it as leader.
    RegisterBroker(BrokerInfo),

    /// Remove a broker and move leadership away from it.
    DeregisterBroker { broker_id: i32 },

    CreateTopic {
        name: String,
        partitions: i32,
        replication_factor: i32,
    },

    DeleteTopic { name: String },

    /// Clean leader election: the new leader must be in the ISR.
    SetPartitionLeader {
        topic: String,
        partition: i32,
        leader: i32,
    },

    /// ISR change proposed by the current partition leader. Fenced by
    /// `leader_epoch`.
    UpdateIsr {
        topic: String,
        partition: i32,
        leader_epoch: i32,
        isr: Vec<i32>,
    },
}

impl MetadataCommand {
    /// Short name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            MetadataCommand::RegisterBroker(_) => "register_broker",
            MetadataCommand::DeregisterBroker { .. } => "deregister_broker",
            MetadataCommand::CreateTopic { .. } => "create_topic",
            MetadataCommand::DeleteTopic { .. } => "delete_topic",
            MetadataCommand::SetPartitionLeader { .. } => "set_partition_leader",
            MetadataCommand::UpdateIsr { .. } => "update_isr",
        }
    }
}

/// Responses from applying commands to the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataResponse {
    Ok,

    TopicCreated { name: String, partitions: i32 },

    /// Leadership moved; carries the new epoch.
    LeaderChanged { leader: i32, leader_epoch: i32 },

    IsrUpdated { isr: Vec<i32> },

    /// The command was rejected. The state is unchanged apart from the
    /// version counter.
    Rejected(MetadataError),
}

impl MetadataResponse {
    /// Split rejections out into an error.
    pub fn into_result(self) -> Result<MetadataResponse, MetadataError> {
        match self {
            MetadataResponse::Rejected(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Reasons the state machine refuses a command.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataError {
    #[error("topic '{0}' already exists")]
    TopicAlreadyExists(String),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("invalid partition count {0}")]
    InvalidPartitions(i32),

    #[error("replication factor {requested} is invalid with {available} registered brokers")]
    InvalidReplicationFactor { requested: i32, available: usize },

    #[error("partition {topic}-{partition} not found")]
    PartitionNotFound { topic: String, partition: i32 },

    #[error("broker {0} not found")]
    BrokerNotFound(i32),

    #[error("broker {leader} is not in the ISR of {topic}-{partition}")]
    LeaderNotInIsr {
        topic: String,
        partition: i32,
        leader: i32,
    },

    #[error("stale leader epoch {given} for {topic}-{partition} (current {current})")]
    StaleLeaderEpoch {
        topic: String,
        partition: i32,
        given: i32,
        current: i32,
    },

    #[error("invalid ISR for {topic}-{partition}: {reason}")]
    InvalidIsr {
        topic: String,
        partition: i32,
        reason: String,
    },
}

impl MetadataError {
    pub fn to_kafka_code(&self) -> KafkaCode {
        match self {
            MetadataError::TopicAlreadyExists(_) => KafkaCode::TopicAlreadyExists,
            MetadataError::TopicNotFound(_) | MetadataError::PartitionNotFound { .. } => {
                KafkaCode::UnknownTopicOrPartition
            }
            MetadataError::InvalidPartitions(_) => KafkaCode::InvalidPartitions,
            MetadataError::InvalidReplicationFactor { .. } => KafkaCode::InvalidReplicationFactor,
            MetadataError::BrokerNotFound(_) => KafkaCode::BrokerNotAvailable,
            MetadataError::LeaderNotInIsr { .. } | MetadataError::InvalidIsr { .. } => {
                KafkaCode::InvalidRequest
            }
            MetadataError::StaleLeaderEpoch { .. } => KafkaCode::NotLeaderForPartition,
        }
    }
}
