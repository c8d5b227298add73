//! Produce request handling.
//!
//! # Acknowledgment semantics
//!
//! - `acks=0`: the batch is appended on the leader like `acks=1`, but the
//!   connection sends no response frame.
//! - `acks=1`: success once the leader has appended the batch.
//! - `acks=-1`: success once the high watermark covers the batch, i.e. every
//!   member of the ISR has it. Fails fast with `NotEnoughReplicas` when the
//!   ISR is smaller than `min_insync_replicas`, and with `RequestTimedOut`
//!   when replication does not catch up within `timeout_ms`.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::cluster::validate_topic_name;
use crate::constants::MAX_CONCURRENT_PARTITION_REQUESTS;
use crate::error::KafkaCode;
use crate::server::RequestContext;
use crate::server::request::{ProducePartitionData, ProduceRequestData};
use crate::server::response::{
    ProducePartitionResponse, ProduceResponseData, ProduceTopicResponse,
};

use super::ClusterHandler;

/// Handle a produce request.
pub(super) async fn handle_produce(
    handler: &ClusterHandler,
    ctx: &RequestContext,
    request: ProduceRequestData,
) -> ProduceResponseData {
    let acks = request.acks;
    let timeout = Duration::from_millis(request.timeout_ms.max(0) as u64);

    debug!(
        client = %ctx.client_addr,
        client_id = ?ctx.client_id,
        topic_count = request.topics.len(),
        acks,
        timeout_ms = request.timeout_ms,
        "PRODUCE request received"
    );

    let mut responses = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let reject = if !matches!(acks, -1..=1) {
            Some(KafkaCode::InvalidRequiredAcks)
        } else if validate_topic_name(&topic.name).is_err() {
            Some(KafkaCode::InvalidTopic)
        } else {
            None
        };
        if let Some(error_code) = reject {
            debug!(topic = %topic.name, ?error_code, "Rejecting produce for topic");
            responses.push(ProduceTopicResponse {
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| ProducePartitionResponse::error(p.partition_index, error_code))
                    .collect(),
                name: topic.name,
            });
            continue;
        }

        let name = topic.name.as_str();
        let appends: Vec<_> = topic
            .partitions
            .into_iter()
            .map(|partition| produce_to_partition(handler, name, partition, acks, timeout))
            .collect();
        let partitions: Vec<_> = stream::iter(appends)
            .buffered(MAX_CONCURRENT_PARTITION_REQUESTS)
            .collect()
            .await;

        responses.push(ProduceTopicResponse {
            name: topic.name,
            partitions,
        });
    }

    ProduceResponseData {
        responses,
        throttle_time_ms: 0,
    }
}

async fn produce_to_partition(
    handler: &ClusterHandler,
    topic: &str,
    partition: ProducePartitionData,
    acks: i16,
    timeout: Duration,
) -> ProducePartitionResponse {
    let index = partition.partition_index;
    let bytes = partition.records.len();
    match handler
        .replica_manager
        .append(topic, index, partition.records, acks, timeout)
        .await
    {
        Ok(info) => {
            debug!(
                topic,
                partition = index,
                base_offset = info.base_offset,
                bytes,
                "Appended batch"
            );
            ProducePartitionResponse::success(index, info.base_offset)
        }
        Err(e) => {
            let error_code = e.to_kafka_code();
            if e.is_not_leader() {
                debug!(topic, partition = index, error = %e, "Produce sent to non-leader");
            } else {
                warn!(topic, partition = index, error = %e, "Produce failed");
            }
            ProducePartitionResponse::error(index, error_code)
        }
    }
}
