//! Raft state machine for cluster metadata.
//!
//! The state machine holds brokers, topics and partition assignments and
//! applies [`MetadataCommand`]s to produce deterministic state transitions.
//! Readers never lock: every apply publishes a fresh `Arc<MetadataState>`
//! through a watch channel, and readers clone the `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::commands::{MetadataCommand, MetadataError, MetadataResponse};

/// A registered broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerInfo {
    pub id: i32,
    /// Advertised Kafka host.
    pub host: String,
    /// Advertised Kafka port.
    pub port: i32,
    /// Cluster RPC address (`host:port`) used for raft and replica fetches.
    pub rpc_addr: String,
    /// Whether the broker takes part in the raft quorum.
    pub voter: bool,
}

/// Leader, replicas and ISR of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    /// Assigned replicas; the first one is the preferred leader.
    pub replicas: Vec<i32>,
    /// Current leader, `-1` when the partition is offline.
    pub leader: i32,
    pub isr: Vec<i32>,
    pub leader_epoch: i32,
}

impl PartitionInfo {
    pub fn has_leader(&self) -> bool {
        self.leader >= 0
    }

    pub fn is_under_replicated(&self) -> bool {
        self.isr.len() < self.replicas.len()
    }

    pub fn preferred_leader(&self) -> Option<i32> {
        self.replicas.first().copied()
    }

    /// Put `brokers` in replica order, dropping anything not assigned.
    fn in_replica_order(&self, brokers: &[i32]) -> Vec<i32> {
        self.replicas
            .iter()
            .copied()
            .filter(|r| brokers.contains(r))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    /// Metadata version the topic was created at. Tells a recreated topic
    /// apart from an earlier one with the same name.
    pub created_version: u64,
    pub replication_factor: i32,
    /// Indexed by partition number.
    pub partitions: Vec<PartitionInfo>,
}

/// The complete metadata state managed by Raft.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MetadataState {
    /// Incremented on every applied command, rejected ones included.
    pub version: u64,
    pub brokers: BTreeMap<i32, BrokerInfo>,
    pub topics: BTreeMap<String, TopicInfo>,
}

impl MetadataState {
    pub fn broker(&self, id: i32) -> Option<&BrokerInfo> {
        self.brokers.get(&id)
    }

    pub fn topic(&self, name: &str) -> Option<&TopicInfo> {
        self.topics.get(name)
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionInfo> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get(topic)?.partitions.get(index)
    }

    /// Every `(topic, partition)` that lists `broker_id` among its replicas.
    pub fn partitions_for_broker(
        &self,
        broker_id: i32,
    ) -> impl Iterator<Item = (&str, &PartitionInfo)> + '_ {
        self.topics.values().flat_map(move |t| {
            t.partitions
                .iter()
                .filter(move |p| p.replicas.contains(&broker_id))
                .map(move |p| (t.name.as_str(), p))
        })
    }

    pub fn under_replicated_count(&self) -> usize {
        self.topics
            .values()
            .flat_map(|t| t.partitions.iter())
            .filter(|p| p.is_under_replicated())
            .count()
    }

    /// Apply one committed command.
    pub fn apply(&mut self, command: MetadataCommand) -> MetadataResponse {
        self.version += 1;
        let result = match command {
            MetadataCommand::RegisterBroker(info) => Ok(self.register_broker(info)),
            MetadataCommand::DeregisterBroker { broker_id } => self.deregister_broker(broker_id),
            MetadataCommand::CreateTopic {
                name,
                partitions,
                replication_factor,
            } => self.create_topic(name, partitions, replication_factor),
            MetadataCommand::DeleteTopic { name } => match self.topics.remove(&name) {
                Some(_) => Ok(MetadataResponse::Ok),
                None => Err(MetadataError::TopicNotFound(name)),
            },
            MetadataCommand::SetPartitionLeader {
                topic,
                partition,
                leader,
            } => self.set_partition_leader(topic, partition, leader),
            MetadataCommand::UpdateIsr {
                topic,
                partition,
                leader_epoch,
                isr,
            } => self.update_isr(topic, partition, leader_epoch, isr),
        };
        result.unwrap_or_else(MetadataResponse::Rejected)
    }

    fn register_broker(&mut self, info: BrokerInfo) -> MetadataResponse {
        let id = info.id;
        self.brokers.insert(id, info);

        for topic in self.topics.values_mut() {
            for p in &mut topic.partitions {
                if !p.has_leader() && p.replicas.contains(&id) {
                    p.leader = id;
                    p.isr = vec![id];
                    p.leader_epoch += 1;
                    tracing::info!(
                        topic = %topic.name,
                        partition = p.partition,
                        leader = id,
                        leader_epoch = p.leader_epoch,
                        "Offline partition recovered by returning broker"
                    );
                }
            }
        }
        MetadataResponse::Ok
    }

    fn deregister_broker(&mut self, broker_id: i32) -> Result<MetadataResponse, MetadataError> {
        if self.brokers.remove(&broker_id).is_none() {
            return Err(MetadataError::BrokerNotFound(broker_id));
        }

        for topic in self.topics.values_mut() {
            for p in &mut topic.partitions {
                p.isr.retain(|&b| b != broker_id);
                if p.leader != broker_id {
                    continue;
                }
                let next = p.replicas.iter().copied().find(|r| p.isr.contains(r));
                p.leader = next.unwrap_or(-1);
                p.leader_epoch += 1;
                match next {
                    Some(leader) => tracing::info!(
                        topic = %topic.name,
                        partition = p.partition,
                        leader,
                        leader_epoch = p.leader_epoch,
                        "Elected new partition leader from ISR"
                    ),
                    None => tracing::warn!(
                        topic = %topic.name,
                        partition = p.partition,
                        "No in-sync replica left, partition is offline"
                    ),
                }
            }
        }
        Ok(MetadataResponse::Ok)
    }

    fn create_topic(
        &mut self,
        name: String,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<MetadataResponse, MetadataError> {
        if self.topics.contains_key(&name) {
            return Err(MetadataError::TopicAlreadyExists(name));
        }
        if partitions <= 0 {
            return Err(MetadataError::InvalidPartitions(partitions));
        }
        let brokers: Vec<i32> = self.brokers.keys().copied().collect();
        if replication_factor <= 0 || replication_factor as usize > brokers.len() {
            return Err(MetadataError::InvalidReplicationFactor {
                requested: replication_factor,
                available: brokers.len(),
            });
        }

        let assignments = (0..partitions)
            .map(|p| {
                let replicas = assign_replicas(&brokers, p, replication_factor as usize);
                PartitionInfo {
                    partition: p,
                    leader: replicas[0],
                    isr: replicas.clone(),
                    replicas,
                    leader_epoch: 0,
                }
            })
            .collect();

        self.topics.insert(
            name.clone(),
            TopicInfo {
                name: name.clone(),
                created_version: self.version,
                replication_factor,
                partitions: assignments,
            },
        );
        Ok(MetadataResponse::TopicCreated { name, partitions })
    }

    fn partition_mut(
        &mut self,
        topic: &str,
        partition: i32,
    ) -> Result<&mut PartitionInfo, MetadataError> {
        let not_found = || MetadataError::PartitionNotFound {
            topic: topic.to_string(),
            partition,
        };
        let index = usize::try_from(partition).map_err(|_| not_found())?;
        self.topics
            .get_mut(topic)
            .ok_or_else(|| MetadataError::TopicNotFound(topic.to_string()))?
            .partitions
            .get_mut(index)
            .ok_or_else(not_found)
    }

    fn set_partition_leader(
        &mut self,
        topic: String,
        partition: i32,
        leader: i32,
    ) -> Result<MetadataResponse, MetadataError> {
        let p = self.partition_mut(&topic, partition)?;
        if !p.isr.contains(&leader) {
            return Err(MetadataError::LeaderNotInIsr {
                topic,
                partition,
                leader,
            });
        }
        p.leader = leader;
        p.leader_epoch += 1;
        Ok(MetadataResponse::LeaderChanged {
            leader,
            leader_epoch: p.leader_epoch,
        })
    }

    fn update_isr(
        &mut self,
        topic: String,
        partition: i32,
        leader_epoch: i32,
        isr: Vec<i32>,
    ) -> Result<MetadataResponse, MetadataError> {
        let unregistered = isr.iter().copied().find(|b| !self.brokers.contains_key(b));
        let p = self.partition_mut(&topic, partition)?;

        if leader_epoch != p.leader_epoch {
            return Err(MetadataError::StaleLeaderEpoch {
                topic,
                partition,
                given: leader_epoch,
                current: p.leader_epoch,
            });
        }
        let invalid = |reason: String| MetadataError::InvalidIsr {
            topic: topic.clone(),
            partition,
            reason,
        };
        if let Some(b) = isr.iter().find(|&&b| !p.replicas.contains(&b)) {
            return Err(invalid(format!("broker {b} is not a replica")));
        }
        if !isr.contains(&p.leader) {
            return Err(invalid(format!("leader {} missing", p.leader)));
        }
        if let Some(b) = unregistered {
            return Err(invalid(format!("broker {b} is not registered")));
        }

        p.isr = p.in_replica_order(&isr);
        Ok(MetadataResponse::IsrUpdated { isr: p.isr.clone() })
    }
}

/// Deterministic replica assignment for partition `partition`.
///
/// `brokers` must be sorted; the starting broker is drawn from an RNG seeded
/// with the partition number, then replicas wrap around the broker list.
pub fn assign_replicas(brokers: &[i32], partition: i32, replication_factor: usize) -> Vec<i32> {
    let n = brokers.len();
    if n == 0 {
        return Vec::new();
    }
    let start = fastrand::Rng::with_seed(partition as u64).usize(..n);
    (0..replication_factor.min(n))
        .map(|j| brokers[(start + j) % n])
        .collect()
}

/// The state machine wrapper publishing snapshots to readers.
#[derive(Clone)]
pub struct MetadataStateMachine {
    state: Arc<watch::Sender<Arc<MetadataState>>>,
}

impl MetadataStateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(MetadataState::default()));
        Self {
            state: Arc::new(tx),
        }
    }

    /// Current state.
    pub fn current(&self) -> Arc<MetadataState> {
        self.state.borrow().clone()
    }

    /// Receiver notified after every applied command.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MetadataState>> {
        self.state.subscribe()
    }

    /// Apply a command and publish the new state.
    pub fn apply_command(&self, command: MetadataCommand) -> MetadataResponse {
        let kind = command.kind();
        let mut response = MetadataResponse::Ok;
        self.state.send_modify(|state| {
            response = Arc::make_mut(state).apply(command);
        });
        if let MetadataResponse::Rejected(e) = &response {
            tracing::debug!(command = kind, error = %e, "Metadata command rejected");
        }
        response
    }

    /// Serialize the current state for a snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self.current().as_ref())
    }

    /// Replace the state with a snapshot.
    pub fn restore(&self, snapshot: &[u8]) -> Result<(), bincode::Error> {
        let restored: MetadataState = bincode::deserialize(snapshot)?;
        self.state.send_replace(Arc::new(restored));
        Ok(())
    }
}

impl Default for MetadataStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(id: i32) -> BrokerInfo {
        BrokerInfo {
            id,
            host: "127.0.0.1".to_string(),
            port: 9092 + id,
            rpc_addr: format!("127.0.0.1:{}", 19093 + id),
            voter: true,
        }
    }

    fn state_with_brokers(ids: &[i32]) -> MetadataState {
        let mut state = MetadataState::default();
        for &id in ids {
            state.apply(MetadataCommand::RegisterBroker(broker(id)));
        }
        state
    }

    fn create(name: &str, partitions: i32, rf: i32) -> MetadataCommand {
        MetadataCommand::CreateTopic {
            name: name.to_string(),
            partitions,
            replication_factor: rf,
        }
    }

    #[test]
    fn test_create_topic_assigns_all_replicas() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        let resp = state.apply(create("orders", 3, 3));
        assert_eq!(
            resp,
            MetadataResponse::TopicCreated {
                name: "orders".to_string(),
                partitions: 3
            }
        );

        let topic = state.topic("orders").unwrap();
        assert_eq!(topic.partitions.len(), 3);
        for p in &topic.partitions {
            let mut replicas = p.replicas.clone();
            replicas.sort();
            assert_eq!(replicas, vec![1, 2, 3]);
            assert_eq!(p.leader, p.replicas[0]);
            assert_eq!(p.isr, p.replicas);
            assert_eq!(p.leader_epoch, 0);
        }
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let brokers = [1, 2, 3, 4, 5];
        for p in 0..16 {
            let a = assign_replicas(&brokers, p, 3);
            let b = assign_replicas(&brokers, p, 3);
            assert_eq!(a, b);
            assert_eq!(a.len(), 3);
            let start = brokers.iter().position(|&x| x == a[0]).unwrap();
            assert_eq!(a[1], brokers[(start + 1) % 5]);
            assert_eq!(a[2], brokers[(start + 2) % 5]);
        }
    }

    #[test]
    fn test_create_topic_validation() {
        let mut state = state_with_brokers(&[1, 2]);
        assert_eq!(
            state.apply(create("t", 0, 1)),
            MetadataResponse::Rejected(MetadataError::InvalidPartitions(0))
        );
        assert_eq!(
            state.apply(create("t", 1, 3)),
            MetadataResponse::Rejected(MetadataError::InvalidReplicationFactor {
                requested: 3,
                available: 2
            })
        );
        assert_eq!(
            state.apply(create("t", 1, 0)),
            MetadataResponse::Rejected(MetadataError::InvalidReplicationFactor {
                requested: 0,
                available: 2
            })
        );
        state.apply(create("t", 1, 2));
        assert_eq!(
            state.apply(create("t", 4, 1)),
            MetadataResponse::Rejected(MetadataError::TopicAlreadyExists("t".to_string()))
        );
        assert_eq!(state.topic("t").unwrap().partitions.len(), 1);
    }

    #[test]
    fn test_every_apply_bumps_version() {
        let mut state = MetadataState::default();
        state.apply(MetadataCommand::DeleteTopic {
            name: "missing".to_string(),
        });
        state.apply(MetadataCommand::RegisterBroker(broker(1)));
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_recreated_topic_gets_new_created_version() {
        let mut state = state_with_brokers(&[1]);
        state.apply(create("t", 1, 1));
        let first = state.topic("t").unwrap().created_version;
        state.apply(MetadataCommand::DeleteTopic {
            name: "t".to_string(),
        });
        state.apply(create("t", 1, 1));
        let second = state.topic("t").unwrap();
        assert!(second.created_version > first);
        assert_eq!(second.partitions[0].leader_epoch, 0);
    }

    #[test]
    fn test_deregister_leader_elects_from_isr() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        state.apply(create("orders", 1, 3));
        let before = state.partition("orders", 0).unwrap().clone();
        let old_leader = before.leader;

        state.apply(MetadataCommand::DeregisterBroker {
            broker_id: old_leader,
        });

        let after = state.partition("orders", 0).unwrap();
        assert_eq!(after.leader, before.replicas[1]);
        assert_eq!(after.leader_epoch, 1);
        assert!(!after.isr.contains(&old_leader));
        assert_eq!(after.replicas, before.replicas);
        assert!(state.broker(old_leader).is_none());
    }

    #[test]
    fn test_deregister_follower_keeps_epoch() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        state.apply(create("orders", 1, 3));
        let p = state.partition("orders", 0).unwrap().clone();
        let follower = p.replicas[2];

        state.apply(MetadataCommand::DeregisterBroker {
            broker_id: follower,
        });
        let after = state.partition("orders", 0).unwrap();
        assert_eq!(after.leader, p.leader);
        assert_eq!(after.leader_epoch, 0);
        assert_eq!(after.isr.len(), 2);
    }

    #[test]
    fn test_offline_partition_recovers_on_register() {
        let mut state = state_with_brokers(&[1]);
        state.apply(create("solo", 1, 1));
        state.apply(MetadataCommand::DeregisterBroker { broker_id: 1 });
        let offline = state.partition("solo", 0).unwrap();
        assert_eq!(offline.leader, -1);
        assert!(offline.isr.is_empty());
        assert_eq!(offline.leader_epoch, 1);

        state.apply(MetadataCommand::RegisterBroker(broker(1)));
        let back = state.partition("solo", 0).unwrap();
        assert_eq!(back.leader, 1);
        assert_eq!(back.isr, vec![1]);
        assert_eq!(back.leader_epoch, 2);
    }

    #[test]
    fn test_deregister_unknown_broker_rejected() {
        let mut state = state_with_brokers(&[1]);
        assert_eq!(
            state.apply(MetadataCommand::DeregisterBroker { broker_id: 9 }),
            MetadataResponse::Rejected(MetadataError::BrokerNotFound(9))
        );
    }

    #[test]
    fn test_set_partition_leader_requires_isr_member() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        state.apply(create("t", 1, 2));
        let p = state.partition("t", 0).unwrap().clone();
        let outsider = [1, 2, 3]
            .into_iter()
            .find(|b| !p.replicas.contains(b))
            .unwrap();

        assert!(matches!(
            state.apply(MetadataCommand::SetPartitionLeader {
                topic: "t".to_string(),
                partition: 0,
                leader: outsider,
            }),
            MetadataResponse::Rejected(MetadataError::LeaderNotInIsr { .. })
        ));

        let resp = state.apply(MetadataCommand::SetPartitionLeader {
            topic: "t".to_string(),
            partition: 0,
            leader: p.replicas[1],
        });
        assert_eq!(
            resp,
            MetadataResponse::LeaderChanged {
                leader: p.replicas[1],
                leader_epoch: 1
            }
        );
    }

    #[test]
    fn test_update_isr_fenced_by_epoch() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        state.apply(create("t", 1, 3));
        let p = state.partition("t", 0).unwrap().clone();
        let shrunk = vec![p.leader, p.replicas[1]];

        assert!(matches!(
            state.apply(MetadataCommand::UpdateIsr {
                topic: "t".to_string(),
                partition: 0,
                leader_epoch: 5,
                isr: shrunk.clone(),
            }),
            MetadataResponse::Rejected(MetadataError::StaleLeaderEpoch { current: 0, .. })
        ));

        let resp = state.apply(MetadataCommand::UpdateIsr {
            topic: "t".to_string(),
            partition: 0,
            leader_epoch: 0,
            isr: shrunk.iter().rev().copied().collect(),
        });
        assert_eq!(resp, MetadataResponse::IsrUpdated { isr: shrunk.clone() });
        assert_eq!(state.partition("t", 0).unwrap().isr, shrunk);
    }

    #[test]
    fn test_update_isr_must_keep_leader() {
        let mut state = state_with_brokers(&[1, 2]);
        state.apply(create("t", 1, 2));
        let p = state.partition("t", 0).unwrap().clone();
        assert!(matches!(
            state.apply(MetadataCommand::UpdateIsr {
                topic: "t".to_string(),
                partition: 0,
                leader_epoch: 0,
                isr: vec![p.replicas[1]],
            }),
            MetadataResponse::Rejected(MetadataError::InvalidIsr { .. })
        ));
    }

    #[test]
    fn test_two_machines_converge() {
        let commands = vec![
            MetadataCommand::RegisterBroker(broker(3)),
            MetadataCommand::RegisterBroker(broker(1)),
            MetadataCommand::RegisterBroker(broker(2)),
            create("a", 4, 2),
            create("b", 2, 3),
            MetadataCommand::DeregisterBroker { broker_id: 2 },
            MetadataCommand::DeleteTopic {
                name: "a".to_string(),
            },
            MetadataCommand::RegisterBroker(broker(2)),
        ];
        let mut left = MetadataState::default();
        let mut right = MetadataState::default();
        for cmd in &commands {
            left.apply(cmd.clone());
        }
        for cmd in commands {
            right.apply(cmd);
        }
        assert_eq!(left, right);
        assert_eq!(
            serde_json::to_string(&left).unwrap(),
            serde_json::to_string(&right).unwrap()
        );
    }

    #[test]
    fn test_partitions_for_broker() {
        let mut state = state_with_brokers(&[1, 2, 3]);
        state.apply(create("t", 6, 1));
        let total: usize = [1, 2, 3]
            .iter()
            .map(|&b| state.partitions_for_broker(b).count())
            .sum();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_state_machine_notifies_and_restores() {
        let sm = MetadataStateMachine::new();
        let mut rx = sm.subscribe();
        sm.apply_command(MetadataCommand::RegisterBroker(broker(1)));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);

        let held = sm.current();
        sm.apply_command(create("t", 1, 1));
        assert!(held.topic("t").is_none());

        let snapshot = sm.snapshot().unwrap();
        let other = MetadataStateMachine::new();
        other.restore(&snapshot).unwrap();
        assert_eq!(*other.current(), *sm.current());
    }
}
