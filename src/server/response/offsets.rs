//! ListOffsets response encoding.
//!
//! | Version | Partition layout |
//! |---------|------------------|
//! | v0 | `partition error_code [offset]` |
//! | v1 | `partition error_code timestamp offset` |
//! | v2 | v1 with a leading `throttle_time_ms` |

use bytes::BufMut;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};

use super::{VersionedEncode, encode_versioned_array};

/// ListOffsets response data.
#[derive(Debug, Clone, Default)]
pub struct ListOffsetsResponseData {
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub timestamp: i64,
    /// -1 when no offset was found.
    pub offset: i64,
}

impl ListOffsetsPartitionResponse {
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        Self {
            partition_index,
            error_code,
            timestamp: -1,
            offset: -1,
        }
    }

    pub fn success(partition_index: i32, offset: i64) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            timestamp: -1,
            offset,
        }
    }
}

impl VersionedEncode for ListOffsetsResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 2 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_versioned_array(buffer, &self.topics, version)
    }
}

impl VersionedEncode for ListOffsetsTopicResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.name.encode(buffer)?;
        encode_versioned_array(buffer, &self.partitions, version)
    }
}

impl VersionedEncode for ListOffsetsPartitionResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.partition_index.encode(buffer)?;
        (self.error_code as i16).encode(buffer)?;
        if version == 0 {
            let offsets: &[i64] = if self.offset >= 0 {
                std::slice::from_ref(&self.offset)
            } else {
                &[]
            };
            encode_array(buffer, offsets)
        } else {
            self.timestamp.encode(buffer)?;
            self.offset.encode(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(p: &ListOffsetsPartitionResponse, version: i16) -> Vec<u8> {
        let mut buf = Vec::new();
        p.encode_versioned(&mut buf, version).unwrap();
        buf
    }

    #[test]
    fn test_v0_uses_offset_array() {
        let buf = encode(&ListOffsetsPartitionResponse::success(1, 500), 0);
        // partition(4) + error(2) + count(4) + offset(8)
        assert_eq!(buf.len(), 18);
        assert_eq!(&buf[6..10], &[0, 0, 0, 1]);
        assert_eq!(&buf[10..18], &500i64.to_be_bytes());
    }

    #[test]
    fn test_v0_error_has_empty_offsets() {
        let buf = encode(
            &ListOffsetsPartitionResponse::error(1, KafkaCode::UnknownTopicOrPartition),
            0,
        );
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[6..10], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_v1_layout() {
        let buf = encode(&ListOffsetsPartitionResponse::success(1, 500), 1);
        // partition(4) + error(2) + timestamp(8) + offset(8)
        assert_eq!(buf.len(), 22);
        assert_eq!(&buf[14..22], &500i64.to_be_bytes());
    }

    #[test]
    fn test_throttle_only_from_v2() {
        let resp = ListOffsetsResponseData::default();
        let mut v1 = Vec::new();
        resp.encode_versioned(&mut v1, 1).unwrap();
        let mut v2 = Vec::new();
        resp.encode_versioned(&mut v2, 2).unwrap();
        assert_eq!(v1.len(), 4);
        assert_eq!(v2.len(), 8);
    }
}
