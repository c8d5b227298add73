//! `jockey` broker binary.
//!
//! ## Running
//!
//! Single broker:
//! ```bash
//! jockey --id 0 --logdir /tmp/jockey-0
//! ```
//!
//! Three brokers on one host (separate terminals); the first bootstraps the
//! cluster, the others join through its gossip port:
//! ```bash
//! jockey --id 0 --logdir /tmp/j0 --tcpaddr 127.0.0.1:9092 --raftport 9093 --serfport 7946
//! jockey --id 1 --logdir /tmp/j1 --tcpaddr 127.0.0.1:9192 --raftport 9193 --serfport 7947 --serfmembers 127.0.0.1:7946
//! jockey --id 2 --logdir /tmp/j2 --tcpaddr 127.0.0.1:9292 --raftport 9293 --serfport 7948 --serfmembers 127.0.0.1:7946
//! ```
//!
//! Every flag can also be set through a `JOCKEY_*` environment variable.
//! `LOG_FORMAT=json` switches to JSON logs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use jockey::cluster::{
    Broker, BrokerConfig, LogConfig, MembershipConfig, RaftConfig, ServerConfig,
};
use jockey::constants::{DEFAULT_GOSSIP_PORT, DEFAULT_RAFT_PORT};
use jockey::telemetry::{LogFormat, init_logging};

#[derive(Debug, Parser)]
#[command(name = "jockey", version, about = "Clustered Kafka-compatible broker")]
struct Args {
    /// Root directory for partition logs.
    #[arg(long, env = "JOCKEY_LOGDIR", default_value = "/tmp/jockey")]
    logdir: PathBuf,

    /// Kafka listener address.
    #[arg(long, env = "JOCKEY_TCPADDR", default_value = "0.0.0.0:9092")]
    tcpaddr: String,

    /// Consensus log and snapshot directory [default: <logdir>/raft].
    #[arg(long, env = "JOCKEY_RAFTDIR")]
    raftdir: Option<PathBuf>,

    /// Host the cluster RPC server binds to and advertises.
    #[arg(long, env = "JOCKEY_RAFTADDR", default_value = "127.0.0.1")]
    raftaddr: String,

    /// Cluster RPC port.
    #[arg(long, env = "JOCKEY_RAFTPORT", default_value_t = DEFAULT_RAFT_PORT)]
    raftport: u16,

    /// Gossip UDP port.
    #[arg(long, env = "JOCKEY_SERFPORT", default_value_t = DEFAULT_GOSSIP_PORT)]
    serfport: u16,

    /// Gossip seeds (`host:port`), comma separated. Empty bootstraps a new
    /// cluster.
    #[arg(long, env = "JOCKEY_SERFMEMBERS", value_delimiter = ',')]
    serfmembers: Vec<String>,

    /// Broker id, also the raft node id.
    #[arg(long, env = "JOCKEY_ID", default_value_t = 0)]
    id: i32,

    /// Debug logging.
    #[arg(long, env = "JOCKEY_DEBUG")]
    debug: bool,

    /// Optional HTTP listener for /health, /ready and /metrics.
    #[arg(long = "health-addr", env = "JOCKEY_HEALTH_ADDR")]
    health_addr: Option<String>,
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        let raft_dir = self.raftdir.unwrap_or_else(|| self.logdir.join("raft"));
        let advertised_host = self
            .tcpaddr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .filter(|host| !host.is_empty() && *host != "0.0.0.0")
            .unwrap_or(self.raftaddr.as_str())
            .to_string();

        BrokerConfig {
            broker_id: self.id,
            advertised_host,
            log: LogConfig {
                dir: self.logdir,
                ..LogConfig::default()
            },
            raft: RaftConfig {
                node_id: self.id.max(0) as u64,
                raft_dir,
                rpc_addr: format!("{}:{}", self.raftaddr, self.raftport),
                ..RaftConfig::default()
            },
            membership: MembershipConfig {
                bind_addr: format!("0.0.0.0:{}", self.serfport),
                seeds: self
                    .serfmembers
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                ..MembershipConfig::default()
            },
            server: ServerConfig {
                listen_addr: self.tcpaddr,
                health_addr: self.health_addr,
                ..ServerConfig::default()
            },
            ..BrokerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(LogFormat::from_env(), args.debug) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = args.into_config();
    let broker = match Broker::start(config).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Broker failed to start");
            return ExitCode::FAILURE;
        }
    };

    info!(
        broker_id = broker.broker_id(),
        address = %broker.kafka_addr(),
        "Broker is running. Connect with any Kafka client."
    );

    if let Err(e) = wait_for_termination().await {
        error!(error = %e, "Failed to listen for termination signals");
    }

    info!("Termination signal received, draining");
    match broker.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Shutdown finished with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Args::parse_from(["jockey"]).into_config();
        assert_eq!(config.broker_id, 0);
        assert_eq!(config.log.dir, PathBuf::from("/tmp/jockey"));
        assert_eq!(config.raft.raft_dir, PathBuf::from("/tmp/jockey/raft"));
        assert_eq!(config.raft.rpc_addr, "127.0.0.1:9093");
        assert_eq!(config.membership.bind_addr, "0.0.0.0:7946");
        assert!(config.membership.seeds.is_empty());
        assert_eq!(config.advertised_host, "127.0.0.1");
        assert!(config.server.health_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags() {
        let config = Args::parse_from([
            "jockey",
            "--id",
            "2",
            "--logdir",
            "/data",
            "--raftdir",
            "/meta",
            "--tcpaddr",
            "10.0.0.5:9192",
            "--raftport",
            "9193",
            "--serfmembers",
            "10.0.0.1:7946, 10.0.0.2:7946",
            "--health-addr",
            "0.0.0.0:8080",
        ])
        .into_config();
        assert_eq!(config.broker_id, 2);
        assert_eq!(config.raft.node_id, 2);
        assert_eq!(config.raft.raft_dir, PathBuf::from("/meta"));
        assert_eq!(config.raft.rpc_addr, "127.0.0.1:9193");
        assert_eq!(config.advertised_host, "10.0.0.5");
        assert_eq!(
            config.membership.seeds,
            vec!["10.0.0.1:7946".to_string(), "10.0.0.2:7946".to_string()]
        );
        assert_eq!(config.server.health_addr.as_deref(), Some("0.0.0.0:8080"));
    }
}
