//! Cluster handler implementing the Kafka [`Handler`] trait.
//!
//! The handler is stateless apart from its references into the broker:
//! metadata reads come from the committed [`MetadataStore`] snapshot, data
//! operations go through the [`ReplicaManager`] and admin requests become
//! metadata proposals.
//!
//! - `metadata` - Metadata request handling
//! - `produce` - Produce request handling
//! - `fetch` - Fetch request handling
//! - `offsets` - ListOffsets request handling
//! - `admin` - Topic creation and deletion

mod admin;
mod fetch;
mod metadata;
mod offsets;
mod produce;

use std::sync::Arc;

use async_trait::async_trait;

use crate::server::request::*;
use crate::server::response::*;
use crate::server::{Handler, RequestContext};

use super::metadata_store::MetadataStore;
use super::replica_manager::ReplicaManager;

/// Kafka request handler backed by the replicated cluster state.
pub struct ClusterHandler {
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) replica_manager: Arc<ReplicaManager>,
    pub(crate) broker_id: i32,
}

impl ClusterHandler {
    pub fn new(
        store: Arc<MetadataStore>,
        replica_manager: Arc<ReplicaManager>,
        broker_id: i32,
    ) -> Self {
        Self {
            store,
            replica_manager,
            broker_id,
        }
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }
}

#[async_trait]
impl Handler for ClusterHandler {
    #[tracing::instrument(skip(self, _ctx, request), fields(request_id = %_ctx.request_id))]
    async fn handle_metadata(
        &self,
        _ctx: &RequestContext,
        request: MetadataRequestData,
    ) -> MetadataResponseData {
        metadata::handle_metadata(self, request)
    }

    #[tracing::instrument(skip(self, ctx, request), fields(request_id = %ctx.request_id, topic_count = request.topics.len(), acks = request.acks))]
    async fn handle_produce(
        &self,
        ctx: &RequestContext,
        request: ProduceRequestData,
    ) -> ProduceResponseData {
        produce::handle_produce(self, ctx, request).await
    }

    #[tracing::instrument(skip(self, ctx, request), fields(request_id = %ctx.request_id, topic_count = request.topics.len()))]
    async fn handle_fetch(
        &self,
        ctx: &RequestContext,
        request: FetchRequestData,
    ) -> FetchResponseData {
        fetch::handle_fetch(self, ctx, request).await
    }

    #[tracing::instrument(skip(self, ctx, request), fields(request_id = %ctx.request_id))]
    async fn handle_list_offsets(
        &self,
        ctx: &RequestContext,
        request: ListOffsetsRequestData,
    ) -> ListOffsetsResponseData {
        offsets::handle_list_offsets(self, ctx, request)
    }

    #[tracing::instrument(skip(self, _ctx, request), fields(request_id = %_ctx.request_id, topic_count = request.topics.len()))]
    async fn handle_create_topics(
        &self,
        _ctx: &RequestContext,
        request: CreateTopicsRequestData,
    ) -> CreateTopicsResponseData {
        admin::handle_create_topics(self, request).await
    }

    #[tracing::instrument(skip(self, _ctx, request), fields(request_id = %_ctx.request_id, topic_count = request.topic_names.len()))]
    async fn handle_delete_topics(
        &self,
        _ctx: &RequestContext,
        request: DeleteTopicsRequestData,
    ) -> DeleteTopicsResponseData {
        admin::handle_delete_topics(self, request).await
    }
}
