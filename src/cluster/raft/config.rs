//! Configuration for the metadata consensus layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::constants::DEFAULT_RAFT_PORT;

/// Configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's unique ID. By convention it equals the broker id.
    pub node_id: u64,

    /// Directory holding `raft.log`, `vote` and `snapshots/`.
    pub raft_dir: PathBuf,

    /// Address the cluster RPC server binds to (`host:port`). Also advertised
    /// to peers, so it must be reachable from them.
    pub rpc_addr: String,

    /// Heartbeat interval for the Raft leader.
    pub heartbeat_interval: Duration,

    /// Election timeout range (min).
    pub election_timeout_min: Duration,

    /// Election timeout range (max).
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Build a snapshot after this many applied entries.
    pub snapshot_threshold: u64,

    /// How long a proposal may wait for commit.
    pub proposal_timeout: Duration,

    /// Attempts made when forwarding a proposal to the leader.
    pub forward_retries: u32,

    /// Timeout of a single cluster RPC.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            raft_dir: PathBuf::from("/tmp/jockey/raft"),
            rpc_addr: format!("127.0.0.1:{DEFAULT_RAFT_PORT}"),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_payload_entries: 300,
            snapshot_threshold: 1_000,
            proposal_timeout: Duration::from_secs(5),
            forward_retries: 5,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl RaftConfig {
    /// Collect every problem with this configuration.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.proposal_timeout.is_zero() {
            errors.push("proposal_timeout must be greater than 0".to_string());
        }

        if self.forward_retries == 0 {
            errors.push("forward_retries must be at least 1".to_string());
        }

        if self.rpc_addr.is_empty() {
            errors.push("rpc_addr must not be empty".to_string());
        }

        errors
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.raft_dir.join("snapshots")
    }

    /// Convert to the openraft engine configuration.
    pub fn to_openraft_config(&self) -> ClusterResult<Arc<openraft::Config>> {
        let config = openraft::Config {
            cluster_name: "jockey".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        };
        let config = config
            .validate()
            .map_err(|e| ClusterError::Config(format!("invalid raft config: {e}")))?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RaftConfig::default();
        assert!(config.errors().is_empty());
        assert!(config.to_openraft_config().is_ok());
    }

    #[test]
    fn test_election_timeout_order() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(500),
            ..Default::default()
        };
        let errors = config.errors();
        assert!(errors.iter().any(|e| e.contains("election_timeout_min")));
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(400),
            ..Default::default()
        };
        assert!(config.errors().iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_openraft_mapping() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 42,
            ..Default::default()
        };
        let raft = config.to_openraft_config().unwrap();
        assert_eq!(raft.heartbeat_interval, 50);
        assert_eq!(raft.election_timeout_min, 300);
        assert!(matches!(
            raft.snapshot_policy,
            openraft::SnapshotPolicy::LogsSinceLast(42)
        ));
    }

    #[test]
    fn test_snapshot_dir_is_under_raft_dir() {
        let config = RaftConfig {
            raft_dir: PathBuf::from("/data/raft"),
            ..Default::default()
        };
        assert_eq!(config.snapshot_dir(), PathBuf::from("/data/raft/snapshots"));
    }
}
