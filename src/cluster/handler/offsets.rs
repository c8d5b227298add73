//! ListOffsets request handling.
//!
//! `-1` resolves to the high watermark, `-2` to the log start offset and any
//! other timestamp to the first committed offset whose batch carries a
//! timestamp at or after it (or the high watermark when none does).

use tracing::debug;

use crate::cluster::validate_topic_name;
use crate::error::KafkaCode;
use crate::server::RequestContext;
use crate::server::request::ListOffsetsRequestData;
use crate::server::response::{
    ListOffsetsPartitionResponse, ListOffsetsResponseData, ListOffsetsTopicResponse,
};

use super::ClusterHandler;

/// Handle a list offsets request.
pub(super) fn handle_list_offsets(
    handler: &ClusterHandler,
    ctx: &RequestContext,
    request: ListOffsetsRequestData,
) -> ListOffsetsResponseData {
    debug!(
        client = %ctx.client_addr,
        replica_id = request.replica_id,
        topic_count = request.topics.len(),
        "LIST_OFFSETS request received"
    );

    let mut topics = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let invalid = validate_topic_name(&topic.name).is_err();
        let partitions = topic
            .partitions
            .iter()
            .map(|p| {
                let index = p.partition_index;
                if invalid {
                    return ListOffsetsPartitionResponse::error(index, KafkaCode::InvalidTopic);
                }
                match handler
                    .replica_manager
                    .list_offset(&topic.name, index, p.timestamp)
                {
                    Ok(offset) => ListOffsetsPartitionResponse::success(index, offset),
                    Err(e) => {
                        debug!(topic = %topic.name, partition = index, timestamp = p.timestamp, error = %e, "ListOffsets failed");
                        ListOffsetsPartitionResponse::error(index, e.to_kafka_code())
                    }
                }
            })
            .collect();

        topics.push(ListOffsetsTopicResponse {
            name: topic.name,
            partitions,
        });
    }

    ListOffsetsResponseData {
        throttle_time_ms: 0,
        topics,
    }
}
