//! Controller reconcile loop.
//!
//! Every broker runs a [`Controller`], but only the one on the raft leader
//! does any work. Each pass compares gossip membership with committed
//! metadata and the raft voter set and proposes the difference:
//!
//! - live members missing from (or stale in) metadata are registered;
//! - failed or departed members are deregistered, which moves leadership of
//!   their partitions to another in-sync replica;
//! - joining voters are added as raft learners, then promoted to voters;
//! - voters that left gracefully are removed from the raft membership;
//! - optionally, leadership moves back to a partition's preferred replica
//!   once it is in sync.
//!
//! Passes run every `reconcile_interval` with 10% jitter and immediately on
//! any membership event.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::MembershipConfig;
use super::error::ClusterResult;
use super::membership::{Member, MemberStatus, Membership};
use super::metadata_store::MetadataStore;
use super::metrics;
use super::raft::{MetadataCommand, MetadataResponse, node_id_for};

pub struct Controller {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Controller {
    pub fn start(
        store: Arc<MetadataStore>,
        membership: Arc<dyn Membership>,
        config: MembershipConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let reconciler = Reconciler {
            store,
            membership,
            config,
            started_at: Instant::now(),
        };
        let task = tokio::spawn(reconciler.run(shutdown_rx));
        Self { shutdown_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

struct Reconciler {
    store: Arc<MetadataStore>,
    membership: Arc<dyn Membership>,
    config: MembershipConfig,
    started_at: Instant,
}

impl Reconciler {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.membership.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(jittered(self.config.reconcile_interval)) => {}
                event = events.recv() => match event {
                    Ok(event) => debug!(member = event.member().id, event = ?event, "Membership event"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = self.membership.subscribe();
                    }
                },
            }
            if !self.store.is_controller() {
                continue;
            }
            metrics::CONTROLLER_RECONCILES.inc();
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Controller reconcile pass failed");
            }
        }
        debug!("Controller stopped");
    }

    async fn reconcile(&self) -> ClusterResult<()> {
        let alive = self.membership.alive_members();
        self.sync_brokers(&alive).await?;
        self.sync_raft_members(&alive).await?;
        if self.config.preferred_leader_rebalance {
            self.rebalance_preferred_leaders(&alive).await?;
        }
        Ok(())
    }

    /// Register live members and deregister dead ones.
    async fn sync_brokers(&self, alive: &[Member]) -> ClusterResult<()> {
        let metadata = self.store.read();
        for member in alive {
            let info = member.broker_info();
            if metadata.broker(member.id) == Some(&info) {
                continue;
            }
            info!(broker_id = member.id, host = %info.host, port = info.port, "Registering broker");
            self.propose(MetadataCommand::RegisterBroker(info)).await?;
        }

        let local_id = self.membership.local_member().id;
        let known: Vec<(Member, MemberStatus)> = self.membership.members();
        // Brokers gossip has never heard of are only dropped once gossip has
        // had time to learn about every live member.
        let settled = self.started_at.elapsed() > self.config.failure_timeout * 2;
        for &broker_id in metadata.brokers.keys() {
            if broker_id == local_id || alive.iter().any(|m| m.id == broker_id) {
                continue;
            }
            let status = known
                .iter()
                .find(|(m, _)| m.id == broker_id)
                .map(|(_, status)| *status);
            let reason = match status {
                Some(MemberStatus::Failed) => "failed",
                Some(MemberStatus::Left) => "left",
                None if settled => "unknown",
                _ => continue,
            };
            info!(broker_id, reason, "Deregistering broker");
            self.propose(MetadataCommand::DeregisterBroker { broker_id })
                .await?;
        }
        Ok(())
    }

    /// Keep the raft voter set in step with live voting members.
    async fn sync_raft_members(&self, alive: &[Member]) -> ClusterResult<()> {
        let node = self.store.node();
        let voters = node.voter_ids();
        let learners = node.learner_ids();

        let mut promote = BTreeSet::new();
        for member in alive {
            let id = node_id_for(member.id);
            if voters.contains(&id) {
                continue;
            }
            if !learners.contains(&id) {
                info!(broker_id = member.id, rpc_addr = %member.rpc_addr, "Adding raft learner");
                node.add_learner(id, member.rpc_addr.clone()).await?;
            }
            if member.voter {
                promote.insert(id);
            }
        }
        if !promote.is_empty() {
            let new_voters: BTreeSet<_> = voters.union(&promote).copied().collect();
            info!(promoted = ?promote, "Promoting raft learners to voters");
            node.change_membership(new_voters).await?;
        }

        let departed: BTreeSet<_> = self
            .membership
            .members()
            .into_iter()
            .filter(|(_, status)| *status == MemberStatus::Left)
            .map(|(m, _)| node_id_for(m.id))
            .filter(|id| *id != node.node_id() && (voters.contains(id) || learners.contains(id)))
            .collect();
        if !departed.is_empty() {
            info!(removed = ?departed, "Removing departed raft members");
            node.remove_nodes(departed).await?;
        }
        Ok(())
    }

    /// Move leadership back to each partition's first replica when it is alive
    /// and in sync.
    async fn rebalance_preferred_leaders(&self, alive: &[Member]) -> ClusterResult<()> {
        let metadata = self.store.read();
        for topic in metadata.topics.values() {
            for p in &topic.partitions {
                let Some(preferred) = p.preferred_leader() else {
                    continue;
                };
                if preferred == p.leader
                    || !p.isr.contains(&preferred)
                    || !alive.iter().any(|m| m.id == preferred)
                {
                    continue;
                }
                info!(
                    topic = %topic.name,
                    partition = p.partition,
                    from = p.leader,
                    to = preferred,
                    "Moving leadership to preferred replica"
                );
                self.propose(MetadataCommand::SetPartitionLeader {
                    topic: topic.name.clone(),
                    partition: p.partition,
                    leader: preferred,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn propose(&self, command: MetadataCommand) -> ClusterResult<()> {
        let kind = command.kind();
        if let MetadataResponse::Rejected(e) = self.store.propose(command).await? {
            // Lost a race with another commit; the next pass sees fresh state.
            debug!(command = kind, error = %e, "Controller proposal rejected");
        }
        Ok(())
    }
}

fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(0.9 + fastrand::f64() * 0.2)
}
