//! Broker assembly and lifecycle.
//!
//! [`Broker::start`] wires the subsystems together in dependency order:
//!
//! 1. consensus node (opens `<raftdir>`, starts the cluster RPC server)
//! 2. Kafka listener bound (not yet serving) so the advertised port is known
//! 3. gossip membership, then either bootstrap a new metadata cluster (no
//!    seeds, no prior state) or join through the seeds
//! 4. self registration in metadata
//! 5. controller reconcile loop, replica manager, protocol server, health
//!
//! [`Broker::shutdown`] drains in the reverse direction under
//! [`SHUTDOWN_DRAIN_TIMEOUT`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use object_store::local::LocalFileSystem;
use openraft::ServerState;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::BrokerConfig;
use super::controller::Controller;
use super::error::{ClusterError, ClusterResult};
use super::handler::ClusterHandler;
use super::membership::{GossipMembership, Member, Membership};
use super::metadata_store::MetadataStore;
use super::metrics;
use super::raft::{MetadataCommand, RaftNode};
use super::replica_manager::ReplicaManager;
use super::retry;
use crate::constants::SHUTDOWN_DRAIN_TIMEOUT;
use crate::server::KafkaServer;
use crate::server::health::HealthServer;

/// How long a bootstrapping node waits to elect itself.
const BOOTSTRAP_ELECTION_WAIT: Duration = Duration::from_secs(10);

/// Period of the status watcher (raft gauges, uptime, readiness).
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// A running broker.
pub struct Broker {
    broker_id: i32,
    node: Arc<RaftNode>,
    store: Arc<MetadataStore>,
    replica_manager: Arc<ReplicaManager>,
    membership: Arc<GossipMembership>,
    controller: Controller,
    server: Arc<KafkaServer<ClusterHandler>>,
    health: Option<Arc<HealthServer>>,
    kafka_addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Validate `config` and start every subsystem.
    ///
    /// Fails when a listener cannot bind, when local partition logs or the
    /// consensus log are corrupt, or when a bootstrapping node cannot elect
    /// itself.
    pub async fn start(config: BrokerConfig) -> ClusterResult<Self> {
        let config = config.validate()?;
        let broker_id = config.broker_id;

        metrics::init_metrics();
        metrics::init_broker_info(broker_id, &config.advertised_host, env!("CARGO_PKG_VERSION"));

        info!(
            broker_id,
            log_dir = %config.log.dir.display(),
            raft_dir = %config.raft.raft_dir.display(),
            listen_addr = %config.server.listen_addr,
            rpc_addr = %config.raft.rpc_addr,
            gossip_addr = %config.membership.bind_addr,
            seeds = ?config.membership.seeds,
            "Starting broker"
        );

        std::fs::create_dir_all(&config.log.dir)?;
        std::fs::create_dir_all(&config.raft.raft_dir)?;
        let snapshots = Arc::new(LocalFileSystem::new_with_prefix(&config.raft.raft_dir)?);
        let node = Arc::new(RaftNode::new(config.raft.clone(), snapshots).await?);
        let store = Arc::new(MetadataStore::new(node.clone()));

        let replica_manager = ReplicaManager::new(
            broker_id,
            config.log.clone(),
            config.replication.clone(),
            config.raft.rpc_timeout,
            store.clone(),
        );

        let handler = Arc::new(ClusterHandler::new(
            store.clone(),
            replica_manager.clone(),
            broker_id,
        ));
        let server = KafkaServer::with_handler(&config.server, handler)
            .await
            .map_err(|e| ClusterError::Config(format!("failed to bind kafka listener: {e}")))?;
        let kafka_addr = server
            .local_addr()
            .map_err(|e| ClusterError::Config(format!("kafka listener has no address: {e}")))?;

        let local = Member {
            id: broker_id,
            gossip_addr: local_gossip_addr(&config),
            kafka_host: config.advertised_host.clone(),
            kafka_port: i32::from(kafka_addr.port()),
            rpc_addr: node.rpc_addr().to_string(),
            voter: true,
        };
        let membership = Arc::new(GossipMembership::start(local, config.membership.clone()).await?);

        let seeds = &config.membership.seeds;
        if seeds.is_empty() {
            if !node.is_initialized() {
                node.initialize_cluster().await?;
            }
            node.wait_for_leader(BOOTSTRAP_ELECTION_WAIT).await?;
            register(&store, membership.local_member()).await?;
        } else {
            let reached = membership.join(seeds).await?;
            if reached == 0 {
                warn!(broker_id, seeds = ?seeds, "No gossip seed reachable, waiting to be contacted");
            }
            let store = store.clone();
            let member = membership.local_member().clone();
            tokio::spawn(async move {
                if let Err(e) = register(&store, &member).await {
                    warn!(broker_id = member.id, error = %e, "Self registration failed, relying on the controller");
                }
            });
        }

        let controller = Controller::start(
            store.clone(),
            membership.clone() as Arc<dyn Membership>,
            config.membership.clone(),
        );

        replica_manager.start().await?;

        let server = Arc::new(server);
        let (shutdown_tx, _) = broadcast::channel(1);
        let ready = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        tasks.push({
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "Kafka server stopped with an error");
                }
            })
        });

        tasks.push(tokio::spawn(watch_status(
            broker_id,
            node.clone(),
            store.clone(),
            ready.clone(),
            shutdown_tx.subscribe(),
        )));

        let health = match &config.server.health_addr {
            Some(addr) => {
                let health = Arc::new(
                    HealthServer::new(addr, ready.clone(), broker_id)
                        .await
                        .map_err(|e| ClusterError::Config(format!("failed to bind health listener {addr}: {e}")))?,
                );
                let runner = health.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = runner.run().await {
                        error!(error = %e, "Health server stopped with an error");
                    }
                }));
                Some(health)
            }
            None => None,
        };

        info!(broker_id, kafka_addr = %kafka_addr, rpc_addr = %node.rpc_addr(), "Broker started");

        Ok(Self {
            broker_id,
            node,
            store,
            replica_manager,
            membership,
            controller,
            server,
            health,
            kafka_addr,
            ready,
            shutdown_tx,
            tasks,
        })
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Address the Kafka listener is bound to.
    pub fn kafka_addr(&self) -> SocketAddr {
        self.kafka_addr
    }

    /// Advertised gossip address, usable as a seed for other brokers.
    pub fn gossip_addr(&self) -> &str {
        &self.membership.local_member().gossip_addr
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn replica_manager(&self) -> &Arc<ReplicaManager> {
        &self.replica_manager
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Drain and stop the broker:
    ///
    /// 1. stop accepting connections
    /// 2. wait for open connections to finish
    /// 3. stop the controller and replication tasks
    /// 4. checkpoint high watermarks and close logs
    /// 5. leave gossip
    /// 6. shut down the consensus node
    ///
    /// Steps past the overall deadline are cut short; the consensus node is
    /// always shut down.
    pub async fn shutdown(self) -> ClusterResult<()> {
        let broker_id = self.broker_id;
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        info!(broker_id, "Shutting down broker");
        self.ready.store(false, Ordering::SeqCst);

        if !self.server.shutdown_and_wait(SHUTDOWN_DRAIN_TIMEOUT / 2).await {
            warn!(broker_id, "Connections still open after drain window");
        }
        if let Some(health) = &self.health {
            health.shutdown();
        }
        let _ = self.shutdown_tx.send(());

        let replica_manager = self.replica_manager.clone();
        let controller = self.controller;
        let stopped = tokio::time::timeout(remaining(deadline), async move {
            controller.stop().await;
            replica_manager.close().await;
        })
        .await;
        if stopped.is_err() {
            warn!(broker_id, "Timed out stopping replication and closing logs");
        }

        match tokio::time::timeout(remaining(deadline), self.membership.leave()).await {
            Ok(Err(e)) => warn!(broker_id, error = %e, "Failed to leave gossip cleanly"),
            Err(_) => warn!(broker_id, "Timed out leaving gossip"),
            Ok(Ok(())) => {}
        }

        for task in self.tasks {
            task.abort();
        }

        let result = self.node.shutdown().await;
        info!(broker_id, "Broker stopped");
        result
    }
}

async fn register(store: &MetadataStore, member: &Member) -> ClusterResult<()> {
    retry::with_policy(
        "register_broker",
        retry::leader_election_policy(),
        || store.propose_forwarded(MetadataCommand::RegisterBroker(member.broker_info())),
        ClusterError::is_retriable,
    )
    .await?
    .into_result()?;
    info!(broker_id = member.id, "Registered in cluster metadata");
    Ok(())
}

/// Publish raft gauges and uptime, and track readiness: registered in
/// metadata with a known metadata leader.
async fn watch_status(
    broker_id: i32,
    node: Arc<RaftNode>,
    store: Arc<MetadataStore>,
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let raft = node.metrics();
                let state = match raft.state {
                    ServerState::Follower => 0,
                    ServerState::Candidate => 1,
                    ServerState::Leader => 2,
                    ServerState::Learner => 3,
                    ServerState::Shutdown => -1,
                };
                let applied = raft.last_applied.map_or(0, |id| id.index);
                metrics::set_raft_status(state, raft.current_term, applied);
                metrics::update_broker_uptime();

                let now_ready = raft.current_leader.is_some()
                    && store.read().broker(broker_id).is_some();
                if ready.swap(now_ready, Ordering::SeqCst) != now_ready {
                    info!(broker_id, ready = now_ready, "Broker readiness changed");
                }
            }
        }
    }
}

/// Gossip address advertised to peers: the advertised host with the gossip
/// bind port. A zero port is resolved by the membership layer.
fn local_gossip_addr(config: &BrokerConfig) -> String {
    let port = config
        .membership
        .bind_addr
        .rsplit_once(':')
        .map_or("0", |(_, port)| port);
    format!("{}:{port}", config.advertised_host)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
