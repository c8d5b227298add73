//! Response encoding for outgoing Kafka protocol messages.
//!
//! Response bodies change shape between API versions, so every body type
//! implements [`VersionedEncode`]. The frame around a body is always
//! `[i32 size][i32 correlation_id][body]`.

mod admin;
mod fetch;
mod metadata;
mod offsets;
mod produce;
mod versions;

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};

pub use admin::*;
pub use fetch::*;
pub use metadata::*;
pub use offsets::*;
pub use produce::*;
pub use versions::*;

/// Encoding of a response body for a given API version.
pub trait VersionedEncode {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()>;
}

/// Encode `items` as a classic (i32 length) array of versioned elements.
pub(crate) fn encode_versioned_array<T: VersionedEncode, W: BufMut>(
    buffer: &mut W,
    items: &[T],
    version: i16,
) -> Result<()> {
    crate::encode::encode_as_array(buffer, items, |buf, item| {
        item.encode_versioned(buf, version)
    })
}

/// NULLABLE_STRING: i16 length, or -1 for null.
pub(crate) fn encode_nullable_string<W: BufMut>(s: Option<&str>, buffer: &mut W) -> Result<()> {
    match s {
        Some(val) => val.encode(buffer),
        None => (-1i16).encode(buffer),
    }
}

/// Response header for Kafka protocol.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

impl ToByte for ResponseHeader {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.correlation_id.encode(buffer)
    }
}

/// An encoded response body and the request it answers.
pub struct Response {
    pub correlation_id: i32,
    body: Vec<u8>,
}

impl Response {
    /// Encode `body` for `version`.
    pub fn new<T: VersionedEncode>(correlation_id: i32, body: &T, version: i16) -> Result<Self> {
        let mut buf = Vec::new();
        body.encode_versioned(&mut buf, version)?;
        Ok(Self::new_raw(correlation_id, buf))
    }

    /// Wrap a pre-encoded body.
    pub fn new_raw(correlation_id: i32, body: Vec<u8>) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    /// Encode the full frame including the size prefix.
    pub fn encode_with_size(&self) -> Result<Vec<u8>> {
        let header = ResponseHeader {
            correlation_id: self.correlation_id,
        };
        let mut header_buf = Vec::with_capacity(4);
        header.encode(&mut header_buf)?;

        let total_size = (header_buf.len() + self.body.len()) as i32;
        let mut result = Vec::with_capacity(4 + total_size as usize);
        total_size.encode(&mut result)?;
        result.extend_from_slice(&header_buf);
        result.extend_from_slice(&self.body);
        Ok(result)
    }
}

/// Error-only body, sent for unsupported APIs and undecodable requests.
#[derive(Debug, Clone)]
pub struct ErrorResponseData {
    pub error_code: KafkaCode,
}

impl VersionedEncode for ErrorResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        (self.error_code as i16).encode(buffer)
    }
}
