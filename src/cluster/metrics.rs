//! Prometheus metrics for the broker.
//!
//! Metrics cover:
//! - Connection management (active, accepted, rejected)
//! - Request processing (count, latency per API)
//! - Produce/Fetch throughput (messages, bytes per topic/partition)
//! - Replication (ISR changes, under-replicated and led partitions)
//! - Consensus and membership (proposal latency, raft role, alive members)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "jockey" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully - if a metric fails to register,
//! the metric is still returned but will not appear in the registry.

use std::sync::atomic::{AtomicI64, Ordering};

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for broker metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("jockey".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_gauge_vec!(MY_GAUGE, "my_metric", "Description", ["label1"]);
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Connection metrics
// =============================================================================

define_gauge!(
    ACTIVE_CONNECTIONS,
    "active_connections",
    "Number of active TCP connections"
);
define_counter_vec!(
    TOTAL_CONNECTIONS,
    "total_connections",
    "Total number of connections by outcome",
    ["status"]
);

// =============================================================================
// Request metrics
// =============================================================================

define_counter_vec!(
    REQUEST_COUNT,
    "requests_total",
    "Total number of Kafka API requests",
    ["api", "status"]
);
define_histogram_vec!(
    REQUEST_DURATION,
    "request_duration_seconds",
    "Request processing duration in seconds",
    ["api"],
    [
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
    ]
);

// =============================================================================
// Produce / Fetch metrics
// =============================================================================

define_counter_vec!(
    MESSAGES_PRODUCED,
    "messages_produced_total",
    "Total number of messages produced",
    ["topic", "partition"]
);
define_counter_vec!(
    BYTES_PRODUCED,
    "bytes_produced_total",
    "Total bytes produced",
    ["topic", "partition"]
);
define_counter_vec!(
    BYTES_FETCHED,
    "bytes_fetched_total",
    "Total bytes returned to consumers",
    ["topic", "partition"]
);

// =============================================================================
// Replication metrics
// =============================================================================

define_gauge!(
    LEADER_PARTITIONS,
    "leader_partitions",
    "Number of partitions this broker leads"
);
define_gauge!(
    FOLLOWER_PARTITIONS,
    "follower_partitions",
    "Number of partitions this broker follows"
);
define_gauge!(
    UNDER_REPLICATED_PARTITIONS,
    "under_replicated_partitions",
    "Partitions led by this broker whose ISR is smaller than the replica set"
);
define_counter_vec!(
    ISR_CHANGES,
    "isr_changes_total",
    "ISR shrinks and expansions committed by partition leaders on this broker",
    ["direction"]
);
define_counter_vec!(
    REPLICA_FETCHES,
    "replica_fetches_total",
    "Follower fetches served by this broker",
    ["status"]
);

// =============================================================================
// Consensus and membership metrics
// =============================================================================

define_histogram_vec!(
    RAFT_PROPOSAL_DURATION,
    "raft_proposal_duration_seconds",
    "Metadata proposal latency by outcome",
    ["status"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
);
define_gauge!(
    RAFT_STATE,
    "raft_state",
    "Raft role of this node: 0=follower, 1=candidate, 2=leader, 3=learner"
);
define_gauge!(RAFT_TERM, "raft_term", "Current raft term");
define_gauge!(
    RAFT_APPLIED_INDEX,
    "raft_applied_index",
    "Last raft log index applied to the metadata state machine"
);
define_gauge!(
    ALIVE_MEMBERS,
    "alive_members",
    "Gossip members currently believed alive, including this broker"
);
define_counter!(
    CONTROLLER_RECONCILES,
    "controller_reconciles_total",
    "Reconcile passes run while this broker was the controller"
);

/// Retry attempts by policy and outcome.
///
/// Labels:
/// - `policy`: proposal, leader_election
/// - `outcome`: attempt, success, exhausted
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "retry_attempts_total",
        "Retry attempts by policy and outcome",
        &["policy", "outcome"],
    )
});

// =============================================================================
// Broker Info Metrics
// =============================================================================

/// Broker info metric with static labels for identification.
/// This metric always has value 1 and provides broker metadata via labels.
pub static BROKER_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_safe(
        &REGISTRY,
        "broker_info",
        "Broker information (always 1, labels provide metadata)",
        &["broker_id", "host", "version"],
    )
});

pub static BROKER_UPTIME: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "broker_uptime_seconds",
        "Broker uptime in seconds since start",
    )
});

static BROKER_START_TIME: AtomicI64 = AtomicI64::new(0);

// =============================================================================
// Registration helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so that scrapes list them before
/// their first update. Idempotent.
pub fn init_metrics() {
    let _ = &*ACTIVE_CONNECTIONS;
    let _ = &*TOTAL_CONNECTIONS;
    let _ = &*REQUEST_COUNT;
    let _ = &*REQUEST_DURATION;
    let _ = &*MESSAGES_PRODUCED;
    let _ = &*BYTES_PRODUCED;
    let _ = &*BYTES_FETCHED;
    let _ = &*LEADER_PARTITIONS;
    let _ = &*FOLLOWER_PARTITIONS;
    let _ = &*UNDER_REPLICATED_PARTITIONS;
    let _ = &*ISR_CHANGES;
    let _ = &*REPLICA_FETCHES;
    let _ = &*RAFT_PROPOSAL_DURATION;
    let _ = &*RAFT_STATE;
    let _ = &*RAFT_TERM;
    let _ = &*RAFT_APPLIED_INDEX;
    let _ = &*ALIVE_MEMBERS;
    let _ = &*CONTROLLER_RECONCILES;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*BROKER_INFO;
    let _ = &*BROKER_UPTIME;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a Kafka API request.
pub fn record_request(api: &str, status: &str, duration_secs: f64) {
    REQUEST_COUNT.with_label_values(&[api, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[api])
        .observe(duration_secs);
}

/// Record a connection outcome: "accepted", "rejected_ip_limit",
/// "rejected_total_limit" or "closed".
pub fn record_connection(status: &str) {
    TOTAL_CONNECTIONS.with_label_values(&[status]).inc();
}

pub fn record_produce(topic: &str, partition: i32, message_count: u64, bytes: u64) {
    let partition = partition.to_string();
    MESSAGES_PRODUCED
        .with_label_values(&[topic, partition.as_str()])
        .inc_by(message_count);
    BYTES_PRODUCED
        .with_label_values(&[topic, partition.as_str()])
        .inc_by(bytes);
}

pub fn record_fetch(topic: &str, partition: i32, bytes: u64) {
    BYTES_FETCHED
        .with_label_values(&[topic, &partition.to_string()])
        .inc_by(bytes);
}

/// Record a committed ISR change; `direction` is "shrink" or "expand".
pub fn record_isr_change(direction: &str) {
    ISR_CHANGES.with_label_values(&[direction]).inc();
}

pub fn record_replica_fetch(status: &str) {
    REPLICA_FETCHES.with_label_values(&[status]).inc();
}

pub fn set_partition_roles(leaders: usize, followers: usize, under_replicated: usize) {
    LEADER_PARTITIONS.set(leaders as i64);
    FOLLOWER_PARTITIONS.set(followers as i64);
    UNDER_REPLICATED_PARTITIONS.set(under_replicated as i64);
}

/// Record a metadata proposal latency.
///
/// # Arguments
/// * `status` - "success", "not_leader", "timeout", "error" or "backpressure"
/// * `duration_secs` - The proposal duration in seconds
pub fn record_raft_proposal(status: &str, duration_secs: f64) {
    RAFT_PROPOSAL_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn set_raft_status(state: i64, term: u64, applied_index: u64) {
    RAFT_STATE.set(state);
    RAFT_TERM.set(term as i64);
    RAFT_APPLIED_INDEX.set(applied_index as i64);
}

pub fn set_alive_members(count: usize) {
    ALIVE_MEMBERS.set(count as i64);
}

/// Initialize broker info metrics.
///
/// Call this once at broker startup to set static broker information.
pub fn init_broker_info(broker_id: i32, host: &str, version: &str) {
    let broker_str = broker_id.to_string();
    BROKER_INFO
        .with_label_values(&[broker_str.as_str(), host, version])
        .set(1);
    BROKER_START_TIME.store(unix_secs(), Ordering::SeqCst);
}

/// Refresh the uptime gauge; called before every scrape.
pub fn update_broker_uptime() {
    let start = BROKER_START_TIME.load(Ordering::SeqCst);
    if start > 0 {
        BROKER_UPTIME.set((unix_secs() - start).max(0));
    }
}

fn unix_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
