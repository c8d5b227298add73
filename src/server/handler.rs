//! Handler trait for processing Kafka requests.
//!
//! Implement the `Handler` trait to provide the broker logic behind each
//! supported API. Every method has a default that answers with an error
//! for each requested topic and partition, so test servers only implement
//! what they exercise.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::KafkaCode;

use super::request::*;
use super::response::*;
use super::versions;

/// Context for a request, containing connection information.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The client's address.
    pub client_addr: SocketAddr,
    /// The API version of the request.
    pub api_version: i16,
    /// The client ID from the request header.
    pub client_id: Option<String>,
    /// Unique request ID for correlation across logs.
    pub request_id: uuid::Uuid,
}

/// Trait for handling Kafka protocol requests.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle an ApiVersions request.
    async fn handle_api_versions(
        &self,
        _ctx: &RequestContext,
        _request: ApiVersionsRequestData,
    ) -> ApiVersionsResponseData {
        ApiVersionsResponseData {
            error_code: KafkaCode::None,
            api_keys: versions::default_api_versions(),
            throttle_time_ms: 0,
        }
    }

    /// Handle a Metadata request.
    async fn handle_metadata(
        &self,
        _ctx: &RequestContext,
        _request: MetadataRequestData,
    ) -> MetadataResponseData {
        MetadataResponseData {
            brokers: vec![],
            controller_id: -1,
            topics: vec![],
        }
    }

    /// Handle a Produce request.
    ///
    /// The returned response is dropped by the connection when `acks == 0`.
    async fn handle_produce(
        &self,
        _ctx: &RequestContext,
        request: ProduceRequestData,
    ) -> ProduceResponseData {
        ProduceResponseData {
            responses: request
                .topics
                .into_iter()
                .map(|topic| ProduceTopicResponse {
                    name: topic.name,
                    partitions: topic
                        .partitions
                        .into_iter()
                        .map(|p| {
                            ProducePartitionResponse::error(
                                p.partition_index,
                                KafkaCode::UnknownTopicOrPartition,
                            )
                        })
                        .collect(),
                })
                .collect(),
            throttle_time_ms: 0,
        }
    }

    /// Handle a Fetch request.
    async fn handle_fetch(
        &self,
        _ctx: &RequestContext,
        request: FetchRequestData,
    ) -> FetchResponseData {
        FetchResponseData {
            throttle_time_ms: 0,
            responses: request
                .topics
                .into_iter()
                .map(|topic| FetchTopicResponse {
                    name: topic.name,
                    partitions: topic
                        .partitions
                        .into_iter()
                        .map(|p| {
                            FetchPartitionResponse::error(
                                p.partition_index,
                                KafkaCode::UnknownTopicOrPartition,
                            )
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Handle a ListOffsets request.
    async fn handle_list_offsets(
        &self,
        _ctx: &RequestContext,
        request: ListOffsetsRequestData,
    ) -> ListOffsetsResponseData {
        ListOffsetsResponseData {
            throttle_time_ms: 0,
            topics: request
                .topics
                .into_iter()
                .map(|topic| ListOffsetsTopicResponse {
                    name: topic.name,
                    partitions: topic
                        .partitions
                        .into_iter()
                        .map(|p| {
                            ListOffsetsPartitionResponse::error(
                                p.partition_index,
                                KafkaCode::UnknownTopicOrPartition,
                            )
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Handle a CreateTopics request.
    async fn handle_create_topics(
        &self,
        _ctx: &RequestContext,
        request: CreateTopicsRequestData,
    ) -> CreateTopicsResponseData {
        CreateTopicsResponseData {
            topics: request
                .topics
                .into_iter()
                .map(|t| CreateTopicResponseData::new(t.name, KafkaCode::NotController))
                .collect(),
        }
    }

    /// Handle a DeleteTopics request.
    async fn handle_delete_topics(
        &self,
        _ctx: &RequestContext,
        request: DeleteTopicsRequestData,
    ) -> DeleteTopicsResponseData {
        DeleteTopicsResponseData {
            throttle_time_ms: 0,
            responses: request
                .topic_names
                .into_iter()
                .map(|name| DeleteTopicResponseData {
                    name,
                    error_code: KafkaCode::NotController,
                })
                .collect(),
        }
    }

    /// Handle an unknown API key or an unsupported version.
    async fn handle_unsupported(
        &self,
        _ctx: &RequestContext,
        _api_key: ApiKey,
        _data: Bytes,
    ) -> ErrorResponseData {
        ErrorResponseData {
            error_code: KafkaCode::UnsupportedVersion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DefaultHandler;

    impl Handler for DefaultHandler {}

    fn ctx() -> RequestContext {
        RequestContext {
            client_addr: "127.0.0.1:1234".parse().unwrap(),
            api_version: 0,
            client_id: None,
            request_id: uuid::Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_default_api_versions_lists_supported_apis() {
        let resp = DefaultHandler
            .handle_api_versions(&ctx(), ApiVersionsRequestData::default())
            .await;
        assert_eq!(resp.error_code, KafkaCode::None);
        assert_eq!(resp.api_keys.len(), versions::SUPPORTED_VERSIONS.len());
    }

    #[tokio::test]
    async fn test_default_produce_rejects_every_partition() {
        let request = ProduceRequestData {
            transactional_id: None,
            acks: 1,
            timeout_ms: 1000,
            topics: vec![ProduceTopicData {
                name: "t".to_string(),
                partitions: vec![
                    ProducePartitionData {
                        partition_index: 0,
                        records: Bytes::new(),
                    },
                    ProducePartitionData {
                        partition_index: 1,
                        records: Bytes::new(),
                    },
                ],
            }],
        };
        let resp = DefaultHandler.handle_produce(&ctx(), request).await;
        let partitions = &resp.responses[0].partitions;
        assert_eq!(partitions.len(), 2);
        assert!(
            partitions
                .iter()
                .all(|p| p.error_code == KafkaCode::UnknownTopicOrPartition)
        );
    }

    #[tokio::test]
    async fn test_default_unsupported() {
        let resp = DefaultHandler
            .handle_unsupported(&ctx(), ApiKey::Unknown(11), Bytes::new())
            .await;
        assert_eq!(resp.error_code, KafkaCode::UnsupportedVersion);
    }
}
