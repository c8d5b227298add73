//! Clustered, replicated broker.
//!
//! Every broker runs the same set of components:
//!
//! - **Membership** ([`membership`]): UDP gossip tracking which brokers are
//!   alive and where they listen.
//! - **Metadata** ([`raft`], [`metadata_store`]): a raft-replicated state
//!   machine holding brokers, topics and per-partition replicas, leader, ISR
//!   and leader epoch. It only changes through committed commands.
//! - **Partition logs** ([`log`]): segmented, append-only files with a
//!   sparse offset index.
//! - **Replication** ([`replica_manager`] and the replicator tasks): leaders
//!   track follower progress and the high watermark, followers pull batches
//!   over the cluster RPC transport.
//! - **Controller** ([`controller`]): on the raft leader, turns membership
//!   changes into metadata proposals.
//! - **Request handling** ([`ClusterHandler`]): serves Kafka requests
//!   against the above.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────┐
//!              │ Kafka Client │
//!              └──────┬───────┘
//!                     │ produce / fetch to partition leaders
//!       ┌─────────────┼─────────────┐
//!       ▼             ▼             ▼
//!  ┌─────────┐   ┌─────────┐   ┌─────────┐
//!  │Broker 0 │◄─►│Broker 1 │◄─►│Broker 2 │   gossip (UDP)
//!  │ logs    │   │ logs    │   │ logs    │   raft + replica fetch (TCP)
//!  └─────────┘   └─────────┘   └─────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use jockey::cluster::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::start(BrokerConfig::default()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod broker;
mod config;
pub mod controller;
mod error;
mod handler;
pub mod log;
pub mod membership;
pub mod metadata_store;
pub mod metrics;
pub mod raft;
pub mod replica_manager;
mod replicator;
pub mod retry;
mod validation;

pub use broker::Broker;
pub use config::{BrokerConfig, LogConfig, MembershipConfig, ReplicationConfig, ServerConfig};
pub use controller::Controller;
pub use error::{ClusterError, ClusterResult};
pub use handler::ClusterHandler;
pub use membership::{GossipMembership, Member, MemberEvent, MemberStatus, Membership};
pub use metadata_store::{MetadataSnapshot, MetadataStore};
pub use raft::{RaftConfig, RaftNode};
pub use replica_manager::ReplicaManager;
pub use validation::validate_topic_name;
