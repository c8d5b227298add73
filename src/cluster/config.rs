//! Broker configuration.
//!
//! A [`BrokerConfig`] is assembled once at startup (see `main.rs`), validated
//! with [`BrokerConfig::validate`] and then treated as immutable. Each
//! component only receives the sub-config it needs:
//!
//! | Sub-config            | Consumer                                  |
//! |-----------------------|-------------------------------------------|
//! | [`LogConfig`]         | partition logs, replica manager           |
//! | [`ReplicationConfig`] | replicator tasks, produce/fetch handlers  |
//! | [`RaftConfig`]        | consensus node and metadata store         |
//! | [`MembershipConfig`]  | gossip membership and controller          |
//! | [`ServerConfig`]      | protocol server and health endpoint       |

use std::path::PathBuf;
use std::time::Duration;

use super::error::{ClusterError, ClusterResult};
use super::raft::RaftConfig;
use crate::constants::{
    DEFAULT_FETCH_MAX_WAIT, DEFAULT_GOSSIP_FAILURE_TIMEOUT, DEFAULT_GOSSIP_FANOUT,
    DEFAULT_GOSSIP_INTERVAL, DEFAULT_GOSSIP_PORT, DEFAULT_HW_CHECKPOINT_INTERVAL,
    DEFAULT_INDEX_INTERVAL_BYTES, DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MAX_FETCH_RESPONSE_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_MIN_INSYNC_REPLICAS,
    DEFAULT_RECONCILE_INTERVAL, DEFAULT_REPLICA_FETCH_BACKOFF, DEFAULT_REPLICA_FETCH_MAX_BYTES,
    DEFAULT_REPLICA_FETCH_WAIT_MAX, DEFAULT_REPLICA_LAG_TIME_MAX,
    DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS, DEFAULT_REQUEST_READ_TIMEOUT_SECS,
    DEFAULT_SEGMENT_BYTES, INDEX_ENTRY_SIZE,
};

/// Partition log settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Root directory; each partition lives in `<dir>/<topic>-<partition>/`.
    pub dir: PathBuf,
    /// Roll a new segment once the active one reaches this size.
    pub segment_bytes: u64,
    /// Bytes appended between two sparse index entries.
    pub index_interval_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/jockey"),
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            index_interval_bytes: DEFAULT_INDEX_INTERVAL_BYTES,
        }
    }
}

/// Replication and acknowledgement settings.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// A follower that has not caught up for this long leaves the ISR.
    pub replica_lag_time_max: Duration,
    /// Long-poll wait of a follower fetch on the leader.
    pub replica_fetch_wait_max: Duration,
    pub replica_fetch_max_bytes: usize,
    /// Pause between follower fetch attempts after an error.
    pub replica_fetch_backoff: Duration,
    /// Cap on how long a consumer fetch may wait for new data.
    pub fetch_max_wait: Duration,
    /// Minimum ISR size for `acks=-1` produces.
    pub min_insync_replicas: usize,
    pub hw_checkpoint_interval: Duration,
    /// Upper bound of a single fetch response, regardless of what the client asks for.
    pub max_fetch_response_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_lag_time_max: DEFAULT_REPLICA_LAG_TIME_MAX,
            replica_fetch_wait_max: DEFAULT_REPLICA_FETCH_WAIT_MAX,
            replica_fetch_max_bytes: DEFAULT_REPLICA_FETCH_MAX_BYTES,
            replica_fetch_backoff: DEFAULT_REPLICA_FETCH_BACKOFF,
            fetch_max_wait: DEFAULT_FETCH_MAX_WAIT,
            min_insync_replicas: DEFAULT_MIN_INSYNC_REPLICAS,
            hw_checkpoint_interval: DEFAULT_HW_CHECKPOINT_INTERVAL,
            max_fetch_response_size: DEFAULT_MAX_FETCH_RESPONSE_SIZE,
        }
    }
}

/// Gossip membership and controller settings.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// UDP bind address for gossip (`host:port`).
    pub bind_addr: String,
    /// Seed gossip addresses. Empty means this node bootstraps a new cluster.
    pub seeds: Vec<String>,
    pub gossip_interval: Duration,
    pub fanout: usize,
    /// A member not heard from for this long is declared failed.
    pub failure_timeout: Duration,
    /// Period of the controller reconcile loop.
    pub reconcile_interval: Duration,
    /// Move leadership back to the first replica once it is in sync.
    pub preferred_leader_rebalance: bool,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_GOSSIP_PORT}"),
            seeds: Vec::new(),
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            fanout: DEFAULT_GOSSIP_FANOUT,
            failure_timeout: DEFAULT_GOSSIP_FAILURE_TIMEOUT,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            preferred_leader_rebalance: false,
        }
    }
}

/// Protocol server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Kafka listener (`host:port`).
    pub listen_addr: String,
    pub max_connections_per_ip: usize,
    /// Zero disables the limit.
    pub max_total_connections: usize,
    pub max_message_size: usize,
    pub request_read_timeout: Duration,
    pub request_handler_timeout: Duration,
    /// Optional HTTP listener for `/health` and `/metrics`.
    pub health_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9092".to_string(),
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_read_timeout: Duration::from_secs(DEFAULT_REQUEST_READ_TIMEOUT_SECS),
            request_handler_timeout: Duration::from_secs(DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS),
            health_addr: None,
        }
    }
}

/// Complete configuration of one broker process.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub broker_id: i32,
    /// Host clients use to reach this broker's Kafka listener.
    pub advertised_host: String,
    pub log: LogConfig,
    pub replication: ReplicationConfig,
    pub raft: RaftConfig,
    pub membership: MembershipConfig,
    pub server: ServerConfig,
}

impl BrokerConfig {
    /// Port of the Kafka listener, parsed from `server.listen_addr`.
    pub fn advertised_port(&self) -> ClusterResult<i32> {
        port_of(&self.server.listen_addr)
            .map(i32::from)
            .ok_or_else(|| {
                ClusterError::Config(format!(
                    "listen address {} has no port",
                    self.server.listen_addr
                ))
            })
    }

    /// Collect every problem with this configuration.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.broker_id < 0 {
            errors.push(format!("broker id ({}) must be non-negative", self.broker_id));
        }

        if self.advertised_host.is_empty() {
            errors.push("advertised host must not be empty".to_string());
        }

        if port_of(&self.server.listen_addr).is_none() {
            errors.push(format!(
                "listen address ({}) must be host:port",
                self.server.listen_addr
            ));
        }

        if port_of(&self.raft.rpc_addr).is_none() {
            errors.push(format!("rpc address ({}) must be host:port", self.raft.rpc_addr));
        }

        if port_of(&self.membership.bind_addr).is_none() {
            errors.push(format!(
                "gossip address ({}) must be host:port",
                self.membership.bind_addr
            ));
        }

        if self.raft.node_id != self.broker_id as u64 {
            errors.push(format!(
                "raft node id ({}) must equal broker id ({})",
                self.raft.node_id, self.broker_id
            ));
        }

        if self.log.segment_bytes < 1024 {
            errors.push(format!(
                "segment_bytes ({}) must be at least 1024",
                self.log.segment_bytes
            ));
        }

        if self.log.segment_bytes > u32::MAX as u64 {
            errors.push(format!(
                "segment_bytes ({}) must fit the 32-bit index position",
                self.log.segment_bytes
            ));
        }

        if self.log.index_interval_bytes < INDEX_ENTRY_SIZE as u64 {
            errors.push(format!(
                "index_interval_bytes ({}) must be at least {}",
                self.log.index_interval_bytes, INDEX_ENTRY_SIZE
            ));
        }

        let r = &self.replication;
        if r.replica_lag_time_max.is_zero() {
            errors.push("replica_lag_time_max must be greater than 0".to_string());
        }
        if r.replica_fetch_wait_max >= r.replica_lag_time_max {
            errors.push(format!(
                "replica_fetch_wait_max ({:?}) must be less than replica_lag_time_max ({:?})",
                r.replica_fetch_wait_max, r.replica_lag_time_max
            ));
        }
        if r.replica_fetch_max_bytes == 0 {
            errors.push("replica_fetch_max_bytes must be greater than 0".to_string());
        }
        if r.min_insync_replicas == 0 {
            errors.push("min_insync_replicas must be at least 1".to_string());
        }
        if r.max_fetch_response_size < 1024 {
            errors.push(format!(
                "max_fetch_response_size ({}) must be at least 1024",
                r.max_fetch_response_size
            ));
        }

        let m = &self.membership;
        if m.fanout == 0 {
            errors.push("gossip fanout must be at least 1".to_string());
        }
        if m.gossip_interval >= m.failure_timeout {
            errors.push(format!(
                "gossip_interval ({:?}) must be less than failure_timeout ({:?})",
                m.gossip_interval, m.failure_timeout
            ));
        }
        if m.reconcile_interval.is_zero() {
            errors.push("reconcile_interval must be greater than 0".to_string());
        }

        if self.server.max_message_size < 1024 {
            errors.push(format!(
                "max_message_size ({}) must be at least 1024",
                self.server.max_message_size
            ));
        }
        if self.server.max_connections_per_ip == 0 {
            errors.push("max_connections_per_ip must be at least 1".to_string());
        }

        errors.extend(self.raft.errors());
        errors
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(self) -> ClusterResult<Self> {
        let errors = self.errors();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ClusterError::Config(errors.join("; ")))
        }
    }
}

fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse().ok())
}
