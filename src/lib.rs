//! # Jockey
//! A clustered, replicated message broker speaking the Apache Kafka wire
//! protocol.
//!
//! Brokers discover each other through gossip, agree on cluster metadata
//! (brokers, topics, partition leaders and in-sync replica sets) through an
//! embedded raft group, store each partition as a segmented append-only log
//! on local disk and replicate it from the partition leader to its
//! followers. Any Kafka client that speaks the supported API versions can
//! produce to and fetch from it.
//!
//! ## Layers
//! - [`server`]: TCP listener, frame decoding and the [`Handler`](server::Handler)
//!   trait requests are dispatched to.
//! - [`cluster`]: the broker itself. [`cluster::Broker`] assembles membership,
//!   metadata, partition logs, replication and the
//!   [`ClusterHandler`](cluster::ClusterHandler).
//! - [`protocol`]: record batch framing, CRC checks and a minimal encoder and
//!   decoder for uncompressed v2 batches.
//!
//! ## Running a broker
//! ```rust,no_run
//! use jockey::cluster::{Broker, BrokerConfig, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         broker_id: 0,
//!         advertised_host: "127.0.0.1".to_string(),
//!         server: ServerConfig {
//!             listen_addr: "127.0.0.1:9092".to_string(),
//!             ..ServerConfig::default()
//!         },
//!         ..BrokerConfig::default()
//!     };
//!     let broker = Broker::start(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Raft](https://raft.github.io/)

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod server;

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub mod prelude {
    //! Common imports for embedding the broker or writing a custom
    //! [`Handler`](server::Handler).
    //!
    //! ```rust,no_run
    //! use jockey::prelude::*;
    //!
    //! struct NoTopics;
    //!
    //! impl server::Handler for NoTopics {}
    //!
    //! #[tokio::main]
    //! async fn main() {
    //!     let config = ServerConfig::default();
    //!     let server = server::KafkaServer::new(&config, NoTopics).await.unwrap();
    //!     server.run().await.unwrap();
    //! }
    //! ```
    pub use crate::cluster::{Broker, BrokerConfig, ClusterError, ClusterResult, ServerConfig};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::protocol::{
        CrcValidationResult, Record, decode_records, encode_record_batch, patch_base_offset,
        validate_batch_crc,
    };

    pub use bytes;

    pub mod server {
        //! Kafka-compatible server implementation.
        pub use crate::server::*;
    }
}
