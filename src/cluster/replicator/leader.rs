//! Leader-side replication task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::IsrProposer;
use crate::cluster::error::ClusterResult;
use crate::cluster::log::PartitionLog;
use crate::cluster::metrics;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fixed facts about the leadership a task runs for.
#[derive(Debug, Clone)]
pub struct LeaderParams {
    pub topic: Arc<str>,
    pub partition: i32,
    pub local_id: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub leader_epoch: i32,
    /// A follower not caught up for this long is dropped from the ISR.
    pub lag_time_max: Duration,
}

#[derive(Debug)]
pub enum LeaderEvent {
    /// A follower fetched at `fetch_offset`, acknowledging everything below.
    FollowerFetch { replica_id: i32, fetch_offset: i64 },
    /// Records were appended locally.
    Appended,
    /// The committed ISR changed.
    IsrChanged { isr: Vec<i32>, leader_epoch: i32 },
}

/// Handle to a running leader task.
pub struct LeaderHandle {
    events: mpsc::Sender<LeaderEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    leader_epoch: i32,
}

impl LeaderHandle {
    pub fn leader_epoch(&self) -> i32 {
        self.leader_epoch
    }

    /// Queue an event. Dropped when the task is saturated; the periodic
    /// tick recomputes the same state.
    pub fn notify(&self, event: LeaderEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "Leader task event dropped");
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Start the leader task of one partition.
pub fn spawn_leader(
    params: LeaderParams,
    log: Arc<PartitionLog>,
    proposer: Arc<dyn IsrProposer>,
) -> LeaderHandle {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let leader_epoch = params.leader_epoch;
    let state = LeaderState::new(params, log, proposer);
    let task = tokio::spawn(run(state, events_rx, shutdown_rx));
    LeaderHandle {
        events: events_tx,
        shutdown: shutdown_tx,
        task,
        leader_epoch,
    }
}

#[derive(Debug, Clone, Copy)]
struct FollowerProgress {
    /// Last acknowledged log end offset; -1 until the first fetch.
    leo: i64,
    last_caught_up: Instant,
}

struct ProposalOutcome {
    proposed: Vec<i32>,
    result: ClusterResult<Vec<i32>>,
}

struct LeaderState {
    params: LeaderParams,
    log: Arc<PartitionLog>,
    proposer: Arc<dyn IsrProposer>,
    isr: Vec<i32>,
    followers: HashMap<i32, FollowerProgress>,
    /// ISR of the proposal in flight, if any.
    pending: Option<Vec<i32>>,
}

impl LeaderState {
    fn new(params: LeaderParams, log: Arc<PartitionLog>, proposer: Arc<dyn IsrProposer>) -> Self {
        let now = Instant::now();
        let hw = log.high_watermark();
        let followers = params
            .replicas
            .iter()
            .filter(|&&id| id != params.local_id)
            .map(|&id| {
                // ISR members are known to hold at least the HW.
                let leo = if params.isr.contains(&id) { hw } else { -1 };
                (
                    id,
                    FollowerProgress {
                        leo,
                        last_caught_up: now,
                    },
                )
            })
            .collect();
        Self {
            isr: params.isr.clone(),
            params,
            log,
            proposer,
            followers,
            pending: None,
        }
    }

    fn acknowledged_offset(&self, replica: i32) -> i64 {
        if replica == self.params.local_id {
            self.log.log_end_offset()
        } else {
            self.followers.get(&replica).map_or(-1, |p| p.leo)
        }
    }

    /// Move the HW to the minimum acknowledged offset over the ISR and any
    /// replica a pending expansion adds, so a joiner never enters the ISR
    /// behind the HW.
    fn advance_high_watermark(&self) {
        let joining = self
            .pending
            .iter()
            .flatten()
            .filter(|id| !self.isr.contains(id));
        let Some(candidate) = self
            .isr
            .iter()
            .chain(joining)
            .map(|&id| self.acknowledged_offset(id))
            .min()
        else {
            return;
        };
        if self.log.update_high_watermark(candidate) {
            debug!(
                topic = %self.params.topic,
                partition = self.params.partition,
                high_watermark = self.log.high_watermark(),
                "Advanced high watermark"
            );
        }
    }

    fn on_event(&mut self, event: LeaderEvent, proposals: &mpsc::Sender<ProposalOutcome>) {
        match event {
            LeaderEvent::FollowerFetch {
                replica_id,
                fetch_offset,
            } => {
                let leo = self.log.log_end_offset();
                let Some(progress) = self.followers.get_mut(&replica_id) else {
                    debug!(
                        topic = %self.params.topic,
                        partition = self.params.partition,
                        replica_id,
                        "Fetch from a broker that is not a replica"
                    );
                    return;
                };
                progress.leo = fetch_offset.min(leo);
                if fetch_offset >= leo {
                    progress.last_caught_up = Instant::now();
                }
                self.advance_high_watermark();
                self.maybe_expand(proposals);
            }
            LeaderEvent::Appended => self.advance_high_watermark(),
            LeaderEvent::IsrChanged { isr, leader_epoch } => {
                if leader_epoch != self.params.leader_epoch {
                    debug!(
                        topic = %self.params.topic,
                        partition = self.params.partition,
                        leader_epoch,
                        "Ignoring ISR of another leader epoch"
                    );
                    return;
                }
                self.apply_isr(isr);
            }
        }
    }

    fn on_tick(&mut self, proposals: &mpsc::Sender<ProposalOutcome>) {
        self.advance_high_watermark();
        if self.pending.is_some() {
            return;
        }
        let lag_max = self.params.lag_time_max;
        let laggards: Vec<i32> = self
            .isr
            .iter()
            .copied()
            .filter(|id| {
                self.followers
                    .get(id)
                    .is_some_and(|p| p.last_caught_up.elapsed() > lag_max)
            })
            .collect();
        if laggards.is_empty() {
            return;
        }
        warn!(
            topic = %self.params.topic,
            partition = self.params.partition,
            laggards = ?laggards,
            "Shrinking ISR"
        );
        let isr = self
            .isr
            .iter()
            .copied()
            .filter(|id| !laggards.contains(id))
            .collect();
        self.propose(isr, proposals);
    }

    fn maybe_expand(&mut self, proposals: &mpsc::Sender<ProposalOutcome>) {
        if self.pending.is_some() {
            return;
        }
        let hw = self.log.high_watermark();
        let joining: Vec<i32> = self
            .followers
            .iter()
            .filter(|(id, p)| !self.isr.contains(id) && p.leo >= 0 && p.leo >= hw)
            .map(|(&id, _)| id)
            .collect();
        if joining.is_empty() {
            return;
        }
        info!(
            topic = %self.params.topic,
            partition = self.params.partition,
            joining = ?joining,
            "Expanding ISR"
        );
        let isr = self
            .params
            .replicas
            .iter()
            .copied()
            .filter(|id| self.isr.contains(id) || joining.contains(id))
            .collect();
        self.propose(isr, proposals);
    }

    fn propose(&mut self, isr: Vec<i32>, proposals: &mpsc::Sender<ProposalOutcome>) {
        self.pending = Some(isr.clone());
        let proposer = self.proposer.clone();
        let topic = self.params.topic.clone();
        let partition = self.params.partition;
        let leader_epoch = self.params.leader_epoch;
        let proposals = proposals.clone();
        tokio::spawn(async move {
            let result = proposer
                .propose_isr(&topic, partition, leader_epoch, isr.clone())
                .await;
            let _ = proposals
                .send(ProposalOutcome {
                    proposed: isr,
                    result,
                })
                .await;
        });
    }

    fn on_proposal_done(&mut self, outcome: ProposalOutcome) {
        self.pending = None;
        match outcome.result {
            Ok(isr) => self.apply_isr(isr),
            Err(e) => {
                warn!(
                    topic = %self.params.topic,
                    partition = self.params.partition,
                    proposed = ?outcome.proposed,
                    error = %e,
                    "ISR proposal failed"
                );
                self.advance_high_watermark();
            }
        }
    }

    fn apply_isr(&mut self, isr: Vec<i32>) {
        if isr == self.isr {
            return;
        }
        let now = Instant::now();
        let expanded = isr.len() > self.isr.len();
        for id in &isr {
            if !self.isr.contains(id)
                && let Some(progress) = self.followers.get_mut(id)
            {
                progress.last_caught_up = now;
            }
        }
        metrics::record_isr_change(if expanded { "expand" } else { "shrink" });
        info!(
            topic = %self.params.topic,
            partition = self.params.partition,
            old_isr = ?self.isr,
            new_isr = ?isr,
            "ISR updated"
        );
        self.isr = isr;
        self.advance_high_watermark();
    }
}

fn tick_interval(lag_time_max: Duration) -> Duration {
    (lag_time_max / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

async fn run(
    mut state: LeaderState,
    mut events: mpsc::Receiver<LeaderEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (proposals_tx, mut proposals_rx) = mpsc::channel(1);
    let mut ticker = tokio::time::interval(tick_interval(state.params.lag_time_max));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        topic = %state.params.topic,
        partition = state.params.partition,
        leader_epoch = state.params.leader_epoch,
        isr = ?state.isr,
        "Leader replication started"
    );
    state.advance_high_watermark();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = events.recv() => state.on_event(event, &proposals_tx),
            Some(outcome) = proposals_rx.recv() => state.on_proposal_done(outcome),
            _ = ticker.tick() => state.on_tick(&proposals_tx),
        }
    }
    debug!(
        topic = %state.params.topic,
        partition = state.params.partition,
        "Leader replication stopped"
    );
}
