//! Gossip-based cluster membership.
//!
//! Every node keeps a table of members, each with a heartbeat counter that
//! only its owner increments. Each gossip round a node bumps its own
//! heartbeat and pushes its whole table to `fanout` random live peers over
//! UDP; the receiver merges entries with higher heartbeats and answers with
//! its own table (push-pull), so a joining node learns the cluster in one
//! round trip.
//!
//! A member whose heartbeat has not advanced for `failure_timeout` is
//! declared failed locally. A member that leaves gracefully gossips a final
//! entry flagged `left`, which the others report as [`MemberEvent::Left`].
//!
//! Datagrams are bincode-encoded [`GossipMessage`]s and must fit a single
//! UDP packet, which bounds the practical cluster size to a few hundred
//! members.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::MembershipConfig;
use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::raft::BrokerInfo;

const MAX_DATAGRAM_SIZE: usize = 65_507;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A broker as advertised through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: i32,
    /// UDP address gossip reaches this member at.
    pub gossip_addr: String,
    pub kafka_host: String,
    pub kafka_port: i32,
    /// Cluster RPC address (raft and replication).
    pub rpc_addr: String,
    /// Whether the member takes part in raft votes.
    pub voter: bool,
}

impl Member {
    pub fn broker_info(&self) -> BrokerInfo {
        BrokerInfo {
            id: self.id,
            host: self.kafka_host.clone(),
            port: self.kafka_port,
            rpc_addr: self.rpc_addr.clone(),
            voter: self.voter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    /// Not heard from within the failure timeout.
    Failed,
    /// Announced a graceful departure.
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join(Member),
    Failed(Member),
    Left(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m) | MemberEvent::Failed(m) | MemberEvent::Left(m) => m,
        }
    }
}

/// Membership directory used by the controller.
#[async_trait]
pub trait Membership: Send + Sync {
    fn local_member(&self) -> &Member;

    /// Every known member other than this node, with its status.
    fn members(&self) -> Vec<(Member, MemberStatus)>;

    /// Live members, including this node.
    fn alive_members(&self) -> Vec<Member> {
        let mut alive: Vec<Member> = self
            .members()
            .into_iter()
            .filter(|(_, status)| *status == MemberStatus::Alive)
            .map(|(member, _)| member)
            .collect();
        alive.push(self.local_member().clone());
        alive.sort_by_key(|m| m.id);
        alive
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent>;

    /// Contact `seeds`; returns how many could be reached with a datagram.
    async fn join(&self, seeds: &[String]) -> ClusterResult<usize>;

    /// Announce departure and stop gossiping.
    async fn leave(&self) -> ClusterResult<()>;
}

/// Entry as exchanged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberState {
    member: Member,
    heartbeat: u64,
    left: bool,
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// Push of the sender's table; answered with `Ack`.
    Sync { from: i32, states: Vec<MemberState> },
    Ack { from: i32, states: Vec<MemberState> },
}

struct Entry {
    state: MemberState,
    status: MemberStatus,
    last_advanced: Instant,
}

struct Inner {
    local: Member,
    config: MembershipConfig,
    socket: UdpSocket,
    table: Mutex<BTreeMap<i32, Entry>>,
    heartbeat: AtomicU64,
    left: AtomicBool,
    events: broadcast::Sender<MemberEvent>,
}

impl Inner {
    fn local_state(&self) -> MemberState {
        MemberState {
            member: self.local.clone(),
            heartbeat: self.heartbeat.load(Ordering::Acquire),
            left: self.left.load(Ordering::Acquire),
        }
    }

    fn digest(&self) -> Vec<MemberState> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<MemberState> = table.values().map(|e| e.state.clone()).collect();
        states.push(self.local_state());
        states
    }

    /// Merge remote entries, returning the events they caused.
    fn merge(&self, states: Vec<MemberState>) -> Vec<MemberEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for state in states {
            if state.member.id == self.local.id {
                continue;
            }
            match table.get_mut(&state.member.id) {
                None => {
                    let status = if state.left {
                        MemberStatus::Left
                    } else {
                        events.push(MemberEvent::Join(state.member.clone()));
                        MemberStatus::Alive
                    };
                    table.insert(
                        state.member.id,
                        Entry {
                            state,
                            status,
                            last_advanced: now,
                        },
                    );
                }
                Some(entry) => {
                    let newer = state.heartbeat > entry.state.heartbeat;
                    let newly_left = state.left && !entry.state.left;
                    if !newer && !newly_left {
                        continue;
                    }
                    let status = if state.left {
                        MemberStatus::Left
                    } else {
                        MemberStatus::Alive
                    };
                    if status != entry.status {
                        events.push(match status {
                            MemberStatus::Left => MemberEvent::Left(state.member.clone()),
                            _ => MemberEvent::Join(state.member.clone()),
                        });
                    }
                    entry.status = status;
                    entry.state = state;
                    entry.last_advanced = now;
                }
            }
        }
        events
    }

    /// Declare members failed whose heartbeat stalled.
    fn detect_failures(&self) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in table.values_mut() {
            if entry.status == MemberStatus::Alive
                && entry.last_advanced.elapsed() >= self.config.failure_timeout
            {
                entry.status = MemberStatus::Failed;
                events.push(MemberEvent::Failed(entry.state.member.clone()));
            }
        }
        events
    }

    fn live_peer_addrs(&self) -> Vec<String> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .values()
            .filter(|e| e.status == MemberStatus::Alive)
            .map(|e| e.state.member.gossip_addr.clone())
            .collect()
    }

    fn publish(&self, events: Vec<MemberEvent>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            match &event {
                MemberEvent::Join(m) => {
                    info!(member = m.id, addr = %m.gossip_addr, "Member joined")
                }
                MemberEvent::Failed(m) => {
                    warn!(member = m.id, addr = %m.gossip_addr, "Member failed")
                }
                MemberEvent::Left(m) => {
                    info!(member = m.id, addr = %m.gossip_addr, "Member left")
                }
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        let alive = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.status == MemberStatus::Alive)
            .count();
        metrics::set_alive_members(alive + 1);
    }

    async fn send(&self, addr: &str, message: &GossipMessage) -> ClusterResult<()> {
        let raw = bincode::serialize(message)?;
        if raw.len() > MAX_DATAGRAM_SIZE {
            return Err(ClusterError::Membership(format!(
                "gossip message of {} bytes exceeds a datagram",
                raw.len()
            )));
        }
        self.socket.send_to(&raw, addr).await?;
        Ok(())
    }

    async fn handle(&self, message: GossipMessage, peer: SocketAddr) {
        let (from, states, reply) = match message {
            GossipMessage::Sync { from, states } => (from, states, true),
            GossipMessage::Ack { from, states } => (from, states, false),
        };
        let events = self.merge(states);
        self.publish(events);

        if reply && !self.left.load(Ordering::Acquire) {
            let ack = GossipMessage::Ack {
                from: self.local.id,
                states: self.digest(),
            };
            if let Err(e) = self.send(&peer.to_string(), &ack).await {
                debug!(peer = %peer, from, error = %e, "Failed to answer gossip sync");
            }
        }
    }

    async fn gossip_round(&self) {
        self.heartbeat.fetch_add(1, Ordering::AcqRel);
        let events = self.detect_failures();
        self.publish(events);

        let mut targets = self.live_peer_addrs();
        if targets.is_empty() {
            // Alone so far: keep knocking on the seeds.
            targets = self.config.seeds.clone();
        }
        fastrand::shuffle(&mut targets);
        targets.truncate(self.config.fanout);

        let message = GossipMessage::Sync {
            from: self.local.id,
            states: self.digest(),
        };
        for addr in targets {
            if let Err(e) = self.send(&addr, &message).await {
                debug!(target = %addr, error = %e, "Gossip send failed");
            }
        }
    }
}

/// UDP gossip implementation of [`Membership`].
pub struct GossipMembership {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipMembership {
    /// Bind the gossip socket and start the receive and gossip loops.
    ///
    /// A zero port in `config.bind_addr` is replaced in the advertised
    /// `gossip_addr` by the port actually bound.
    pub async fn start(mut local: Member, config: MembershipConfig) -> ClusterResult<Self> {
        let socket = UdpSocket::bind(&config.bind_addr).await.map_err(|e| {
            ClusterError::Membership(format!("failed to bind {}: {e}", config.bind_addr))
        })?;
        let bound = socket.local_addr()?;
        if local.gossip_addr.is_empty() || local.gossip_addr.ends_with(":0") {
            let host = local
                .gossip_addr
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .filter(|h| !h.is_empty() && h != "0.0.0.0")
                .unwrap_or_else(|| bound.ip().to_string());
            local.gossip_addr = format!("{host}:{}", bound.port());
        }
        info!(member = local.id, addr = %local.gossip_addr, "Gossip membership started");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            local,
            config,
            socket,
            table: Mutex::new(BTreeMap::new()),
            heartbeat: AtomicU64::new(initial_heartbeat()),
            left: AtomicBool::new(false),
            events,
        });
        metrics::set_alive_members(1);

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(receive_loop(inner.clone(), shutdown.subscribe())),
            tokio::spawn(gossip_loop(inner.clone(), shutdown.subscribe())),
        ];

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stop gossiping without announcing departure. Peers will declare
    /// this node failed.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Start heartbeats at the wall clock so a restarted member outranks the
/// entries peers still hold from its previous run.
fn initial_heartbeat() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}

async fn receive_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            received = inner.socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(message) => inner.handle(message, peer).await,
                    Err(e) => debug!(peer = %peer, error = %e, "Dropping undecodable gossip datagram"),
                },
                Err(e) => {
                    debug!(error = %e, "Gossip receive failed");
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn gossip_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.gossip_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.gossip_round().await,
            _ = shutdown.changed() => return,
        }
    }
}

#[async_trait]
impl Membership for GossipMembership {
    fn local_member(&self) -> &Member {
        &self.inner.local
    }

    fn members(&self) -> Vec<(Member, MemberStatus)> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| (e.state.member.clone(), e.status))
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.inner.events.subscribe()
    }

    async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        let message = GossipMessage::Sync {
            from: self.inner.local.id,
            states: self.inner.digest(),
        };
        let mut reached = 0;
        for seed in seeds {
            match self.inner.send(seed, &message).await {
                Ok(()) => reached += 1,
                Err(e) => warn!(seed = %seed, error = %e, "Failed to contact gossip seed"),
            }
        }
        if !seeds.is_empty() && reached == 0 {
            return Err(ClusterError::Membership(
                "no gossip seed could be contacted".to_string(),
            ));
        }
        Ok(reached)
    }

    async fn leave(&self) -> ClusterResult<()> {
        self.inner.left.store(true, Ordering::Release);
        self.inner.heartbeat.fetch_add(1, Ordering::AcqRel);
        let message = GossipMessage::Sync {
            from: self.inner.local.id,
            states: vec![self.inner.local_state()],
        };
        for addr in self.inner.live_peer_addrs() {
            if let Err(e) = self.inner.send(&addr, &message).await {
                debug!(target = %addr, error = %e, "Failed to announce departure");
            }
        }
        info!(member = self.inner.local.id, "Left gossip membership");
        self.shutdown().await;
        Ok(())
    }
}
