//! Protocol and configuration constants shared across the broker.
//!
//! # Categories
//!
//! - **Record batch layout**: byte offsets inside a v2 RecordBatch header
//! - **Network**: frame and connection limits
//! - **Partition log**: segment and index sizing
//! - **Replication**: lag, wait and checkpoint defaults
//! - **Coordination**: consensus and gossip timing

use std::time::Duration;

// =============================================================================
// Record batch layout (magic v2)
// =============================================================================

/// Fixed header size of a v2 record batch.
///
/// ```text
/// Offset  Size  Field
/// 0       8     base_offset
/// 8       4     batch_length
/// 12      4     partition_leader_epoch
/// 16      1     magic
/// 17      4     crc
/// 21      2     attributes
/// 23      4     last_offset_delta
/// 27      8     first_timestamp
/// 35      8     max_timestamp
/// 43      8     producer_id
/// 51      2     producer_epoch
/// 53      4     first_sequence
/// 57      4     records_count
/// ```
pub const RECORD_BATCH_HEADER_SIZE: usize = 61;

/// Every log entry (v2 batch or legacy message) starts with
/// `base_offset: i64` then `length: i32`.
pub const LOG_OVERHEAD: usize = 12;

pub const BATCH_BASE_OFFSET: usize = 0;
pub const BATCH_LENGTH_OFFSET: usize = 8;
pub const BATCH_LEADER_EPOCH_OFFSET: usize = 12;
pub const BATCH_MAGIC_OFFSET: usize = 16;
pub const BATCH_CRC_OFFSET: usize = 17;
/// CRC-32C covers `[21..end]` of the batch.
pub const BATCH_CRC_DATA_START: usize = 21;
pub const BATCH_ATTRIBUTES_OFFSET: usize = 21;
pub const BATCH_LAST_OFFSET_DELTA_OFFSET: usize = 23;
pub const BATCH_FIRST_TIMESTAMP_OFFSET: usize = 27;
pub const BATCH_MAX_TIMESTAMP_OFFSET: usize = 35;
pub const BATCH_RECORDS_COUNT_OFFSET: usize = 57;

/// Current record batch format.
pub const RECORD_BATCH_MAGIC: i8 = 2;

/// Maximum number of elements accepted in a protocol array.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

// =============================================================================
// Network
// =============================================================================

/// Largest request frame accepted before the connection is dropped (100 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 100;

/// Zero disables the limit.
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 10_000;

/// An idle connection is closed after this long without a complete request.
pub const DEFAULT_REQUEST_READ_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS: u64 = 60;

/// Partitions of one produce or fetch request served concurrently.
pub const MAX_CONCURRENT_PARTITION_REQUESTS: usize = 16;

/// Overall budget for the graceful drain on shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Partition log
// =============================================================================

pub const DEFAULT_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// Bytes appended between two sparse index entries.
pub const DEFAULT_INDEX_INTERVAL_BYTES: u64 = 4096;

/// Size of one index entry: relative offset (u32) + position (u32).
pub const INDEX_ENTRY_SIZE: usize = 8;

pub const LOG_FILE_SUFFIX: &str = "log";
pub const INDEX_FILE_SUFFIX: &str = "index";
pub const HIGH_WATERMARK_FILE: &str = "high-watermark";

// =============================================================================
// Replication
// =============================================================================

pub const DEFAULT_REPLICA_LAG_TIME_MAX: Duration = Duration::from_secs(10);
pub const DEFAULT_REPLICA_FETCH_WAIT_MAX: Duration = Duration::from_millis(500);
pub const DEFAULT_REPLICA_FETCH_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_REPLICA_FETCH_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_HW_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MIN_INSYNC_REPLICAS: usize = 1;
pub const DEFAULT_MAX_FETCH_RESPONSE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Coordination
// =============================================================================

pub const DEFAULT_RAFT_PORT: u16 = 9093;
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;
pub const DEFAULT_GOSSIP_FAILURE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Kafka topic name limit.
pub const MAX_TOPIC_NAME_LEN: usize = 249;
