//! Metadata response encoding.
//!
//! v1 adds the broker rack, the controller id after the broker list and the
//! `is_internal` flag on every topic.

use bytes::BufMut;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};

use super::{VersionedEncode, encode_nullable_string, encode_versioned_array};

/// Metadata response data.
#[derive(Debug, Clone)]
pub struct MetadataResponseData {
    pub brokers: Vec<BrokerData>,
    /// -1 when no controller is known.
    pub controller_id: i32,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone)]
pub struct BrokerData {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub error_code: KafkaCode,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    pub fn error(name: impl Into<String>, error_code: KafkaCode) -> Self {
        Self {
            error_code,
            name: name.into(),
            is_internal: false,
            partitions: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub error_code: KafkaCode,
    pub partition_index: i32,
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
}

impl VersionedEncode for MetadataResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        encode_versioned_array(buffer, &self.brokers, version)?;
        if version >= 1 {
            self.controller_id.encode(buffer)?;
        }
        encode_versioned_array(buffer, &self.topics, version)
    }
}

impl VersionedEncode for BrokerData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.node_id.encode(buffer)?;
        self.host.encode(buffer)?;
        self.port.encode(buffer)?;
        if version >= 1 {
            encode_nullable_string(self.rack.as_deref(), buffer)?;
        }
        Ok(())
    }
}

impl VersionedEncode for TopicMetadata {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        (self.error_code as i16).encode(buffer)?;
        self.name.encode(buffer)?;
        if version >= 1 {
            self.is_internal.encode(buffer)?;
        }
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for PartitionMetadata {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.error_code as i16).encode(buffer)?;
        self.partition_index.encode(buffer)?;
        self.leader_id.encode(buffer)?;
        encode_array(buffer, &self.replica_nodes)?;
        encode_array(buffer, &self.isr_nodes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> BrokerData {
        BrokerData {
            node_id: 1,
            host: "h".to_string(),
            port: 9092,
            rack: None,
        }
    }

    #[test]
    fn test_broker_layout_per_version() {
        let mut v0 = Vec::new();
        broker().encode_versioned(&mut v0, 0).unwrap();
        // node_id(4) + host(2+1) + port(4)
        assert_eq!(v0.len(), 11);

        let mut v1 = Vec::new();
        broker().encode_versioned(&mut v1, 1).unwrap();
        assert_eq!(v1.len(), 13);
        assert_eq!(&v1[11..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_controller_id_only_in_v1() {
        let response = MetadataResponseData {
            brokers: vec![],
            controller_id: 3,
            topics: vec![],
        };
        let mut v0 = Vec::new();
        response.encode_versioned(&mut v0, 0).unwrap();
        assert_eq!(v0, vec![0, 0, 0, 0, 0, 0, 0, 0]);

        let mut v1 = Vec::new();
        response.encode_versioned(&mut v1, 1).unwrap();
        assert_eq!(v1, vec![0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_topic_layout() {
        let topic = TopicMetadata {
            error_code: KafkaCode::None,
            name: "t".to_string(),
            is_internal: false,
            partitions: vec![PartitionMetadata {
                error_code: KafkaCode::LeaderNotAvailable,
                partition_index: 0,
                leader_id: -1,
                replica_nodes: vec![1, 2],
                isr_nodes: vec![],
            }],
        };
        let mut v0 = Vec::new();
        topic.encode_versioned(&mut v0, 0).unwrap();
        let mut v1 = Vec::new();
        topic.encode_versioned(&mut v1, 1).unwrap();
        assert_eq!(v1.len(), v0.len() + 1);
        // error(2) + name(3) + count(4), then partition error code
        assert_eq!(&v0[9..11], &[0, 5]);
        assert_eq!(&v0[15..19], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_unknown_topic() {
        let topic = TopicMetadata::error("missing", KafkaCode::UnknownTopicOrPartition);
        let mut buf = Vec::new();
        topic.encode_versioned(&mut buf, 0).unwrap();
        assert_eq!(&buf[0..2], &[0, 3]);
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 0]);
    }
}
