//! Produce response encoding.
//!
//! | Version | Layout change |
//! |---------|---------------|
//! | v0 | `[topic [partition error_code base_offset]]` |
//! | v1 | adds trailing `throttle_time_ms` |
//! | v2-v3 | adds `log_append_time` per partition |

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};

use super::{VersionedEncode, encode_versioned_array};

/// Produce response data.
#[derive(Debug, Clone)]
pub struct ProduceResponseData {
    pub responses: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct ProducePartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub base_offset: i64,
    pub log_append_time: i64,
}

impl ProducePartitionResponse {
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        Self {
            partition_index,
            error_code,
            base_offset: -1,
            log_append_time: -1,
        }
    }

    pub fn success(partition_index: i32, base_offset: i64) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            base_offset,
            log_append_time: -1,
        }
    }
}

impl VersionedEncode for ProduceResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        encode_versioned_array(buffer, &self.responses, version)?;
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        Ok(())
    }
}

impl VersionedEncode for ProduceTopicResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.name.encode(buffer)?;
        encode_versioned_array(buffer, &self.partitions, version)
    }
}

impl VersionedEncode for ProducePartitionResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.partition_index.encode(buffer)?;
        (self.error_code as i16).encode(buffer)?;
        self.base_offset.encode(buffer)?;
        if version >= 2 {
            self.log_append_time.encode(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> ProduceResponseData {
        ProduceResponseData {
            responses: vec![ProduceTopicResponse {
                name: "t".to_string(),
                partitions: vec![ProducePartitionResponse::success(0, 100)],
            }],
            throttle_time_ms: 0,
        }
    }

    fn encoded_len(version: i16) -> usize {
        let mut buf = Vec::new();
        response().encode_versioned(&mut buf, version).unwrap();
        buf.len()
    }

    #[test]
    fn test_produce_response_sizes_per_version() {
        // topics(4) + name(2+1) + partitions(4) + partition(4) + error(2) + base(8)
        assert_eq!(encoded_len(0), 25);
        assert_eq!(encoded_len(1), 29);
        assert_eq!(encoded_len(2), 37);
        assert_eq!(encoded_len(3), 37);
    }

    #[test]
    fn test_partition_error_layout() {
        let mut buf = Vec::new();
        ProducePartitionResponse::error(3, KafkaCode::NotLeaderForPartition)
            .encode_versioned(&mut buf, 0)
            .unwrap();
        assert_eq!(&buf[0..4], &[0, 0, 0, 3]);
        assert_eq!(&buf[4..6], &[0, 6]);
        assert_eq!(&buf[6..14], &(-1i64).to_be_bytes());
    }
}
