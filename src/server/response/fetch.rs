//! Fetch response encoding.
//!
//! | Version | Layout change |
//! |---------|---------------|
//! | v0 | `[topic [partition error_code high_watermark records]]` |
//! | v1-v3 | leading `throttle_time_ms` |
//! | v4 | adds `last_stable_offset` and `aborted_transactions` per partition |

use bytes::{BufMut, Bytes};

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};

use super::{VersionedEncode, encode_versioned_array};

/// Fetch response data.
#[derive(Debug, Clone)]
pub struct FetchResponseData {
    pub throttle_time_ms: i32,
    pub responses: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchTopicResponse {
    pub name: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub aborted_transactions: Vec<AbortedTransaction>,
    pub records: Option<Bytes>,
}

impl FetchPartitionResponse {
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        Self {
            partition_index,
            error_code,
            high_watermark: -1,
            last_stable_offset: -1,
            aborted_transactions: vec![],
            records: None,
        }
    }

    /// Without transactions the last stable offset is the high watermark.
    pub fn success(partition_index: i32, high_watermark: i64, records: Option<Bytes>) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            high_watermark,
            last_stable_offset: high_watermark,
            aborted_transactions: vec![],
            records,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

impl VersionedEncode for FetchResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_versioned_array(buffer, &self.responses, version)
    }
}

impl VersionedEncode for FetchTopicResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.name.encode(buffer)?;
        encode_versioned_array(buffer, &self.partitions, version)
    }
}

impl VersionedEncode for FetchPartitionResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.partition_index.encode(buffer)?;
        (self.error_code as i16).encode(buffer)?;
        self.high_watermark.encode(buffer)?;
        if version >= 4 {
            self.last_stable_offset.encode(buffer)?;
            encode_array(buffer, &self.aborted_transactions)?;
        }
        match self.records.as_deref() {
            Some(bytes) => bytes.encode(buffer)?,
            // Some clients choke on a null record set; send an empty one.
            None => 0i32.encode(buffer)?,
        }
        Ok(())
    }
}

impl ToByte for AbortedTransaction {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.first_offset.encode(buffer)
    }
}
