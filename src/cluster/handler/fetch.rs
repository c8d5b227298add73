//! Fetch request handling.
//!
//! Only committed data (below the high watermark) is returned. A fetch with
//! nothing to return waits up to `min(max_wait_ms, fetch_max_wait)` for any
//! requested partition to receive data, then answers with whatever is
//! available, possibly nothing.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, FuturesUnordered, StreamExt};
use tracing::debug;

use crate::cluster::validate_topic_name;
use crate::constants::MAX_CONCURRENT_PARTITION_REQUESTS;
use crate::error::KafkaCode;
use crate::server::RequestContext;
use crate::server::request::{FetchPartitionData, FetchRequestData};
use crate::server::response::{FetchPartitionResponse, FetchResponseData, FetchTopicResponse};

use super::ClusterHandler;

/// Handle a fetch request.
pub(super) async fn handle_fetch(
    handler: &ClusterHandler,
    ctx: &RequestContext,
    request: FetchRequestData,
) -> FetchResponseData {
    debug!(
        client = %ctx.client_addr,
        client_id = ?ctx.client_id,
        topic_count = request.topics.len(),
        max_wait_ms = request.max_wait_ms,
        min_bytes = request.min_bytes,
        "FETCH request received"
    );

    let mut responses = read_all(handler, &request).await;

    let max_wait = Duration::from_millis(request.max_wait_ms.max(0) as u64);
    let fetched: usize = responses
        .iter()
        .flat_map(|t| &t.partitions)
        .map(|p| p.records.as_ref().map_or(0, Bytes::len))
        .sum();
    if fetched == 0
        && request.min_bytes > 0
        && !max_wait.is_zero()
        && wait_for_data(handler, &request, &responses, max_wait).await
    {
        responses = read_all(handler, &request).await;
    }

    apply_response_limit(&mut responses, request.max_bytes);

    FetchResponseData {
        throttle_time_ms: 0,
        responses,
    }
}

/// Read every requested partition without waiting.
async fn read_all(handler: &ClusterHandler, request: &FetchRequestData) -> Vec<FetchTopicResponse> {
    let mut responses = Vec::with_capacity(request.topics.len());
    for topic in &request.topics {
        if validate_topic_name(&topic.name).is_err() {
            debug!(topic = %topic.name, "Invalid topic name in fetch request");
            responses.push(FetchTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| FetchPartitionResponse::error(p.partition_index, KafkaCode::InvalidTopic))
                    .collect(),
            });
            continue;
        }

        let reads: Vec<_> = topic
            .partitions
            .iter()
            .map(|p| fetch_partition(handler, &topic.name, p, Duration::ZERO))
            .collect();
        let partitions: Vec<_> = stream::iter(reads)
            .buffered(MAX_CONCURRENT_PARTITION_REQUESTS)
            .collect()
            .await;

        responses.push(FetchTopicResponse {
            name: topic.name.clone(),
            partitions,
        });
    }
    responses
}

async fn fetch_partition(
    handler: &ClusterHandler,
    topic: &str,
    partition: &FetchPartitionData,
    max_wait: Duration,
) -> FetchPartitionResponse {
    let index = partition.partition_index;
    let max_bytes = partition.partition_max_bytes.max(0) as usize;
    match handler
        .replica_manager
        .fetch(topic, index, partition.fetch_offset, max_bytes, max_wait)
        .await
    {
        Ok(data) => FetchPartitionResponse::success(index, data.high_watermark, Some(data.records)),
        Err(e) => {
            debug!(topic, partition = index, offset = partition.fetch_offset, error = %e, "Fetch failed");
            FetchPartitionResponse::error(index, e.to_kafka_code())
        }
    }
}

/// Wait until any partition that answered without error sees new committed
/// data. Returns `false` when the wait ran out.
async fn wait_for_data(
    handler: &ClusterHandler,
    request: &FetchRequestData,
    responses: &[FetchTopicResponse],
    max_wait: Duration,
) -> bool {
    let mut waiters: FuturesUnordered<_> = request
        .topics
        .iter()
        .zip(responses)
        .flat_map(|(topic, response)| {
            topic
                .partitions
                .iter()
                .zip(&response.partitions)
                .filter(|(_, r)| r.error_code == KafkaCode::None)
                .map(move |(p, _)| fetch_partition(handler, &topic.name, p, max_wait))
        })
        .collect();

    while let Some(response) = waiters.next().await {
        if response.records.as_ref().is_some_and(|r| !r.is_empty()) {
            return true;
        }
    }
    false
}

/// Drop record sets once the response exceeds `max_bytes`. The first
/// non-empty partition is always kept so a large batch cannot stall a
/// consumer.
fn apply_response_limit(responses: &mut [FetchTopicResponse], max_bytes: i32) {
    let budget = max_bytes.max(0) as usize;
    let mut total = 0usize;
    for partition in responses.iter_mut().flat_map(|t| t.partitions.iter_mut()) {
        let Some(records) = &partition.records else {
            continue;
        };
        if records.is_empty() {
            continue;
        }
        if total > 0 && total + records.len() > budget {
            partition.records = Some(Bytes::new());
        } else {
            total += records.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(records: &[usize]) -> FetchTopicResponse {
        FetchTopicResponse {
            name: "t".to_string(),
            partitions: records
                .iter()
                .enumerate()
                .map(|(i, len)| {
                    FetchPartitionResponse::success(i as i32, 10, Some(Bytes::from(vec![0u8; *len])))
                })
                .collect(),
        }
    }

    fn lens(responses: &[FetchTopicResponse]) -> Vec<usize> {
        responses
            .iter()
            .flat_map(|t| &t.partitions)
            .map(|p| p.records.as_ref().map_or(0, Bytes::len))
            .collect()
    }

    #[test]
    fn test_response_limit_keeps_first_batch() {
        let mut responses = vec![topic(&[100, 50])];
        apply_response_limit(&mut responses, 10);
        assert_eq!(lens(&responses), vec![100, 0]);
    }

    #[test]
    fn test_response_limit_within_budget() {
        let mut responses = vec![topic(&[10, 20, 30])];
        apply_response_limit(&mut responses, 60);
        assert_eq!(lens(&responses), vec![10, 20, 30]);
    }

    #[test]
    fn test_response_limit_skips_errors_and_empty() {
        let mut responses = vec![topic(&[0, 40, 40])];
        responses[0].partitions[0] = FetchPartitionResponse::error(0, KafkaCode::OffsetOutOfRange);
        apply_response_limit(&mut responses, 50);
        assert_eq!(lens(&responses), vec![0, 40, 0]);
    }
}
