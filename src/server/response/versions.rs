//! API versions response encoding.

use bytes::BufMut;

use crate::encode::{ToByte, encode_array, encode_compact_array, encode_empty_tagged_fields};
use crate::error::{KafkaCode, Result};

use super::super::request::ApiKey;
use super::VersionedEncode;

/// ApiVersions response data.
#[derive(Debug, Clone)]
pub struct ApiVersionsResponseData {
    pub error_code: KafkaCode,
    pub api_keys: Vec<ApiVersionData>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct ApiVersionData {
    pub api_key: ApiKey,
    pub min_version: i16,
    pub max_version: i16,
}

impl ApiVersionData {
    /// Each flexible entry carries its own tagged field section.
    fn encode_flexible<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.encode(buffer)?;
        encode_empty_tagged_fields(buffer);
        Ok(())
    }
}

impl ToByte for ApiVersionData {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        let api_key_i16: i16 = self.api_key.into();
        api_key_i16.encode(buffer)?;
        self.min_version.encode(buffer)?;
        self.max_version.encode(buffer)?;
        Ok(())
    }
}

impl ApiVersionsResponseData {
    /// v3 body: compact array of entries, then throttle time and an empty
    /// tag buffer. The optional feature tags are never sent.
    pub fn encode_flexible<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.error_code as i16).encode(buffer)?;
        encode_compact_array(buffer, &self.api_keys, |buf, item| {
            item.encode_flexible(buf)
        })?;
        self.throttle_time_ms.encode(buffer)?;
        encode_empty_tagged_fields(buffer);
        Ok(())
    }
}

impl VersionedEncode for ApiVersionsResponseData {
    /// - v0: error_code + api_keys
    /// - v1-v2: adds throttle_time_ms
    /// - v3: flexible encoding
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, api_version: i16) -> Result<()> {
        if api_version >= 3 {
            return self.encode_flexible(buffer);
        }
        (self.error_code as i16).encode(buffer)?;
        encode_array(buffer, &self.api_keys)?;
        if api_version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        Ok(())
    }
}
