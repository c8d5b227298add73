//! Metadata request handling.
//!
//! Answers come straight from the committed metadata snapshot. Unknown
//! topics are reported, never created.

use tracing::debug;

use crate::cluster::raft::{MetadataState, PartitionInfo, TopicInfo};
use crate::cluster::validate_topic_name;
use crate::error::KafkaCode;
use crate::server::request::MetadataRequestData;
use crate::server::response::{BrokerData, MetadataResponseData, PartitionMetadata, TopicMetadata};

use super::ClusterHandler;

/// Handle a metadata request.
pub(super) fn handle_metadata(
    handler: &ClusterHandler,
    request: MetadataRequestData,
) -> MetadataResponseData {
    let state = handler.store.read();
    let controller_id = handler.store.controller_id();
    debug!(
        version = state.version,
        controller_id,
        requested = ?request.topics,
        "METADATA request received"
    );
    build_metadata(&state, controller_id, request.topics.as_deref())
}

/// Build the response for `topics`, or for every topic when `None`.
pub(crate) fn build_metadata(
    state: &MetadataState,
    controller_id: i32,
    topics: Option<&[String]>,
) -> MetadataResponseData {
    let brokers = state
        .brokers
        .values()
        .map(|b| BrokerData {
            node_id: b.id,
            host: b.host.clone(),
            port: b.port,
            rack: None,
        })
        .collect();

    let topics = match topics {
        None => state.topics.values().map(topic_metadata).collect(),
        Some(names) => names
            .iter()
            .map(|name| {
                if validate_topic_name(name).is_err() {
                    TopicMetadata::error(name.as_str(), KafkaCode::InvalidTopic)
                } else {
                    match state.topic(name) {
                        Some(topic) => topic_metadata(topic),
                        None => TopicMetadata::error(name.as_str(), KafkaCode::UnknownTopicOrPartition),
                    }
                }
            })
            .collect(),
    };

    MetadataResponseData {
        brokers,
        controller_id,
        topics,
    }
}

fn topic_metadata(topic: &TopicInfo) -> TopicMetadata {
    TopicMetadata {
        error_code: KafkaCode::None,
        name: topic.name.clone(),
        is_internal: false,
        partitions: topic.partitions.iter().map(partition_metadata).collect(),
    }
}

fn partition_metadata(partition: &PartitionInfo) -> PartitionMetadata {
    let (error_code, leader_id) = if partition.has_leader() {
        (KafkaCode::None, partition.leader)
    } else {
        (KafkaCode::LeaderNotAvailable, -1)
    };
    PartitionMetadata {
        error_code,
        partition_index: partition.partition,
        leader_id,
        replica_nodes: partition.replicas.clone(),
        isr_nodes: partition.isr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::{BrokerInfo, MetadataCommand};

    fn broker(id: i32) -> BrokerInfo {
        BrokerInfo {
            id,
            host: "127.0.0.1".to_string(),
            port: 9092 + id,
            rpc_addr: format!("127.0.0.1:{}", 9192 + id),
            voter: true,
        }
    }

    fn state() -> MetadataState {
        let mut state = MetadataState::default();
        state.apply(MetadataCommand::RegisterBroker(broker(1)));
        state.apply(MetadataCommand::RegisterBroker(broker(2)));
        state.apply(MetadataCommand::CreateTopic {
            name: "orders".to_string(),
            partitions: 2,
            replication_factor: 2,
        });
        state
    }

    #[test]
    fn test_all_topics_and_brokers() {
        let response = build_metadata(&state(), 1, None);
        assert_eq!(response.controller_id, 1);
        assert_eq!(response.brokers.len(), 2);
        assert_eq!(response.brokers[1].port, 9094);
        assert_eq!(response.topics.len(), 1);

        let topic = &response.topics[0];
        assert_eq!(topic.error_code, KafkaCode::None);
        assert_eq!(topic.partitions.len(), 2);
        for p in &topic.partitions {
            assert_eq!(p.error_code, KafkaCode::None);
            assert_eq!(p.replica_nodes.len(), 2);
            assert_eq!(p.isr_nodes, p.replica_nodes);
            assert_eq!(p.leader_id, p.replica_nodes[0]);
        }
    }

    #[test]
    fn test_requested_topics_keep_order_and_errors() {
        let names = vec!["missing".to_string(), "bad/name".to_string(), "orders".to_string()];
        let response = build_metadata(&state(), -1, Some(&names));
        let codes: Vec<_> = response.topics.iter().map(|t| t.error_code).collect();
        assert_eq!(
            codes,
            vec![
                KafkaCode::UnknownTopicOrPartition,
                KafkaCode::InvalidTopic,
                KafkaCode::None
            ]
        );
        assert_eq!(response.topics[0].name, "missing");
        assert!(response.topics[0].partitions.is_empty());
    }

    #[test]
    fn test_empty_topic_list_returns_no_topics() {
        let response = build_metadata(&state(), 1, Some(&[]));
        assert!(response.topics.is_empty());
        assert_eq!(response.brokers.len(), 2);
    }

    #[test]
    fn test_leaderless_partition() {
        let mut state = MetadataState::default();
        state.apply(MetadataCommand::RegisterBroker(broker(1)));
        state.apply(MetadataCommand::CreateTopic {
            name: "solo".to_string(),
            partitions: 1,
            replication_factor: 1,
        });
        state.apply(MetadataCommand::DeregisterBroker { broker_id: 1 });

        let response = build_metadata(&state, -1, None);
        let p = &response.topics[0].partitions[0];
        assert_eq!(p.error_code, KafkaCode::LeaderNotAvailable);
        assert_eq!(p.leader_id, -1);
        assert_eq!(p.replica_nodes, vec![1]);
        assert!(response.brokers.is_empty());
    }
}
