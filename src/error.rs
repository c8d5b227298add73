//! Crate & protocol level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! - [`Error`]: connection, framing and protocol parsing errors raised by the
//!   wire layer. A parse error closes the offending connection.
//! - [`KafkaCode`]: wire protocol error codes carried inside responses.
//!
//! Coordination, storage and replication failures live in
//! [`crate::cluster::ClusterError`], which maps onto a [`KafkaCode`] via
//! `to_kafka_code()` so that one failing partition never tears down a session.

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or connection closed.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Frame size outside the accepted bounds.
    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(i64),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cluster subsystem failed to start or stop.
    #[error("Cluster error: {0}")]
    Cluster(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::ParsingError(a), Error::ParsingError(b)) => a == b,
            (Error::MissingData(a), Error::MissingData(b)) => a == b,
            (Error::InvalidFrameSize(a), Error::InvalidFrameSize(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            (Error::Cluster(a), Error::Cluster(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<crate::cluster::ClusterError> for Error {
    fn from(e: crate::cluster::ClusterError) -> Self {
        use crate::cluster::ClusterError;
        match e {
            ClusterError::Io(io_err) => Error::IoError(io_err.kind()),
            ClusterError::Config(msg) => Error::Config(msg),
            other => Error::Cluster(other.to_string()),
        }
    }
}

/// Error codes carried in Kafka responses.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// There is currently no leader for this partition and hence it is
    /// unavailable for writes.
    LeaderNotAvailable = 5,
    /// The client attempted to send messages to a replica that is not the
    /// leader for some partition. Its metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut = 7,
    /// The broker is not alive.
    BrokerNotAvailable = 8,
    /// The replica is expected on a broker but is not there.
    ReplicaNotAvailable = 9,
    /// The message is larger than the configured maximum.
    MessageSizeTooLarge = 10,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// Illegal topic name, or a write to an internal topic.
    InvalidTopic = 17,
    /// A message batch exceeds the maximum configured segment size.
    RecordListTooLarge = 18,
    /// Fewer in-sync replicas than the configured minimum with acks=-1.
    NotEnoughReplicas = 19,
    /// Written to the log, but with fewer in-sync replicas than required.
    NotEnoughReplicasAfterAppend = 20,
    /// requiredAcks is anything other than -1, 1, or 0.
    InvalidRequiredAcks = 21,
    /// The timestamp of the message is out of acceptable range.
    InvalidTimestamp = 32,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// Topic with this name already exists.
    TopicAlreadyExists = 36,
    /// Number of partitions is below 1.
    InvalidPartitions = 37,
    /// Replication factor is below 1 or larger than the number of available brokers.
    InvalidReplicationFactor = 38,
    /// This is not the correct controller for this cluster.
    NotController = 41,
    /// The request is malformed or its contents are inconsistent.
    InvalidRequest = 42,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_error_io_error() {
        let err = Error::IoError(io::ErrorKind::ConnectionRefused);
        assert_eq!(err, Error::IoError(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert_eq!(err, Error::IoError(io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_error_variants_not_equal() {
        assert_ne!(
            Error::Config("a".into()),
            Error::MissingData("a".into())
        );
        assert_ne!(Error::InvalidFrameSize(-1), Error::InvalidFrameSize(2));
    }

    #[test]
    fn test_parsing_error_display_reports_length() {
        let err = Error::ParsingError(Bytes::from_static(b"abc"));
        assert_eq!(err.to_string(), "Parsing error: invalid data (3 bytes)");
    }

    #[test]
    fn test_kafka_code_from_i16() {
        assert_eq!(KafkaCode::from_i16(0), Some(KafkaCode::None));
        assert_eq!(KafkaCode::from_i16(6), Some(KafkaCode::NotLeaderForPartition));
        assert_eq!(KafkaCode::from_i16(38), Some(KafkaCode::InvalidReplicationFactor));
        assert_eq!(KafkaCode::from_i16(41), Some(KafkaCode::NotController));
        assert_eq!(KafkaCode::from_i16(-1), Some(KafkaCode::Unknown));
        assert_eq!(KafkaCode::from_i16(1000), None);
    }

    #[test]
    fn test_kafka_code_default_is_none() {
        assert_eq!(KafkaCode::default(), KafkaCode::None);
        assert_eq!(KafkaCode::NotEnoughReplicas as i16, 19);
    }
}
