//! Retry policies shared by the coordination paths.
//!
//! Every policy is an exponential backoff with jitter built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `proposal_policy` | 50ms | 2s | caller | forwarded metadata proposals |
//! | `leader_election_policy` | 100ms | 3s | 30 | waiting out a raft election |
//!
//! # Example
//!
//! ```rust,no_run
//! use jockey::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::proposal_policy(5))
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(result)
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for metadata proposals forwarded to the raft leader.
///
/// `retries` comes from `RaftConfig::forward_retries`.
pub fn proposal_policy(retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(retries as usize)
        .with_jitter()
}

/// Policy for operations that must outlast a leader election, such as a
/// broker registering itself at startup.
pub fn leader_election_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(3))
        .with_max_times(30)
        .with_jitter()
}

/// Run `operation` under `policy`, retrying while `condition` holds and
/// recording attempts under `policy_name`.
pub async fn with_policy<F, Fut, T, E, C>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
    mut condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(policy)
        .when(|e| condition(e))
        .notify(|e, delay| {
            attempt += 1;
            record_retry_attempt(policy_name, attempt);
            tracing::debug!(
                policy = policy_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Retrying"
            );
        })
        .await;
    match &result {
        Ok(_) if attempt > 0 => record_retry_outcome(policy_name, "success"),
        Err(_) if attempt > 0 => {
            record_retry_outcome(policy_name, "exhausted");
            tracing::warn!(policy = policy_name, attempts = attempt + 1, "Retry policy exhausted");
        }
        _ => {}
    }
    result
}

fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();
    tracing::trace!(policy = policy_name, attempt, "Retry attempt");
}

fn record_retry_outcome(policy_name: &str, outcome: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, outcome])
        .inc();
}
