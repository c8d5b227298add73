//! Admin request handling (create/delete topics).
//!
//! Both requests turn into metadata proposals and so only succeed on the
//! controller (the metadata leader). Elsewhere they fail with
//! `NotController` and the client retries against the `controller_id` it
//! learns from a Metadata request.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::cluster::ClusterError;
use crate::cluster::raft::{MetadataCommand, MetadataError, MetadataState};
use crate::cluster::validate_topic_name;
use crate::error::KafkaCode;
use crate::server::request::{CreateTopicData, CreateTopicsRequestData, DeleteTopicsRequestData};
use crate::server::response::{
    CreateTopicResponseData, CreateTopicsResponseData, DeleteTopicResponseData,
    DeleteTopicsResponseData,
};

use super::ClusterHandler;

/// Handle a create topics request.
pub(super) async fn handle_create_topics(
    handler: &ClusterHandler,
    request: CreateTopicsRequestData,
) -> CreateTopicsResponseData {
    let mut seen = HashSet::new();
    let duplicates: HashSet<String> = request
        .topics
        .iter()
        .filter(|t| !seen.insert(t.name.as_str()))
        .map(|t| t.name.clone())
        .collect();

    let mut topics = Vec::with_capacity(request.topics.len());
    for topic in &request.topics {
        if duplicates.contains(&topic.name) {
            topics.push(
                CreateTopicResponseData::new(&topic.name, KafkaCode::InvalidRequest)
                    .with_message("topic appears more than once in the request"),
            );
            continue;
        }
        if let Some(rejection) = precheck(topic) {
            topics.push(rejection);
            continue;
        }

        let result = if request.validate_only {
            validate_only(handler, topic)
        } else {
            create_topic(handler, topic).await
        };
        topics.push(result);
    }

    CreateTopicsResponseData { topics }
}

/// Checks that need no metadata.
fn precheck(topic: &CreateTopicData) -> Option<CreateTopicResponseData> {
    if let Err(e) = validate_topic_name(&topic.name) {
        debug!(topic = %topic.name, "Invalid topic name in create_topics request");
        let message = match e {
            ClusterError::InvalidTopic(reason) => reason,
            other => other.to_string(),
        };
        return Some(
            CreateTopicResponseData::new(&topic.name, KafkaCode::InvalidTopic)
                .with_message(message),
        );
    }
    if topic.has_assignments {
        return Some(
            CreateTopicResponseData::new(&topic.name, KafkaCode::InvalidRequest)
                .with_message("manual replica assignment is not supported"),
        );
    }
    None
}

fn validate_only(handler: &ClusterHandler, topic: &CreateTopicData) -> CreateTopicResponseData {
    if !handler.store.is_controller() {
        return CreateTopicResponseData::new(&topic.name, KafkaCode::NotController);
    }
    let state = handler.store.read();
    match check_create(&state, topic) {
        Ok(()) => CreateTopicResponseData::new(&topic.name, KafkaCode::None),
        Err(e) => CreateTopicResponseData::new(&topic.name, e.to_kafka_code())
            .with_message(e.to_string()),
    }
}

/// Run the create against a scratch copy of `state` so validation applies
/// exactly the rules a committed command would.
fn check_create(state: &MetadataState, topic: &CreateTopicData) -> Result<(), MetadataError> {
    let mut scratch = state.clone();
    scratch
        .apply(create_command(topic))
        .into_result()
        .map(|_| ())
}

fn create_command(topic: &CreateTopicData) -> MetadataCommand {
    MetadataCommand::CreateTopic {
        name: topic.name.clone(),
        partitions: topic.num_partitions,
        replication_factor: i32::from(topic.replication_factor),
    }
}

async fn create_topic(handler: &ClusterHandler, topic: &CreateTopicData) -> CreateTopicResponseData {
    let outcome = handler
        .store
        .propose(create_command(topic))
        .await
        .and_then(|response| response.into_result().map_err(ClusterError::from));

    match outcome {
        Ok(_) => {
            info!(
                topic = %topic.name,
                partitions = topic.num_partitions,
                replication_factor = topic.replication_factor,
                "Created topic"
            );
            CreateTopicResponseData::new(&topic.name, KafkaCode::None)
        }
        Err(e) => {
            let code = e.to_kafka_code();
            if e.is_not_leader() {
                debug!(topic = %topic.name, "CreateTopics sent to non-controller");
                CreateTopicResponseData::new(&topic.name, code)
            } else {
                warn!(topic = %topic.name, error = %e, "Failed to create topic");
                CreateTopicResponseData::new(&topic.name, code).with_message(e.to_string())
            }
        }
    }
}

/// Handle a delete topics request.
pub(super) async fn handle_delete_topics(
    handler: &ClusterHandler,
    request: DeleteTopicsRequestData,
) -> DeleteTopicsResponseData {
    let mut responses = Vec::with_capacity(request.topic_names.len());

    for name in request.topic_names {
        let error_code = if validate_topic_name(&name).is_err() {
            KafkaCode::InvalidTopic
        } else {
            match handler
                .store
                .propose(MetadataCommand::DeleteTopic { name: name.clone() })
                .await
                .and_then(|response| response.into_result().map_err(ClusterError::from))
            {
                Ok(_) => {
                    info!(topic = %name, "Deleted topic");
                    KafkaCode::None
                }
                Err(e) => {
                    debug!(topic = %name, error = %e, "Failed to delete topic");
                    e.to_kafka_code()
                }
            }
        };
        responses.push(DeleteTopicResponseData { name, error_code });
    }

    DeleteTopicsResponseData {
        throttle_time_ms: 0,
        responses,
    }
}
