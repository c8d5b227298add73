//! Admin response encoding (CreateTopics, DeleteTopics).

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};

use super::{VersionedEncode, encode_nullable_string, encode_versioned_array};

// ============================================================================
// CreateTopics
// ============================================================================

/// CreateTopics response data. Neither supported version carries a
/// throttle time.
#[derive(Debug, Clone, Default)]
pub struct CreateTopicsResponseData {
    pub topics: Vec<CreateTopicResponseData>,
}

#[derive(Debug, Clone)]
pub struct CreateTopicResponseData {
    pub name: String,
    pub error_code: KafkaCode,
    pub error_message: Option<String>,
}

impl CreateTopicResponseData {
    pub fn new(name: impl Into<String>, error_code: KafkaCode) -> Self {
        Self {
            name: name.into(),
            error_code,
            error_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

impl VersionedEncode for CreateTopicResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.name.encode(buffer)?;
        (self.error_code as i16).encode(buffer)?;
        if version >= 1 {
            encode_nullable_string(self.error_message.as_deref(), buffer)?;
        }
        Ok(())
    }
}

impl VersionedEncode for CreateTopicsResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        encode_versioned_array(buffer, &self.topics, version)
    }
}

// ============================================================================
// DeleteTopics
// ============================================================================

/// DeleteTopics response data; v1 adds a leading throttle time.
#[derive(Debug, Clone, Default)]
pub struct DeleteTopicsResponseData {
    pub throttle_time_ms: i32,
    pub responses: Vec<DeleteTopicResponseData>,
}

#[derive(Debug, Clone)]
pub struct DeleteTopicResponseData {
    pub name: String,
    pub error_code: KafkaCode,
}

impl ToByte for DeleteTopicResponseData {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        (self.error_code as i16).encode(buffer)
    }
}

impl VersionedEncode for DeleteTopicsResponseData {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.responses.as_slice().encode(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_topics_v0_layout() {
        let response = CreateTopicsResponseData {
            topics: vec![CreateTopicResponseData::new("t", KafkaCode::TopicAlreadyExists)],
        };
        let mut buf = Vec::new();
        response.encode_versioned(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1, 0, 1, b't', 0, 36]);
    }

    #[test]
    fn test_create_topics_v1_adds_message() {
        let response = CreateTopicsResponseData {
            topics: vec![
                CreateTopicResponseData::new("t", KafkaCode::InvalidTopic).with_message("bad"),
            ],
        };
        let mut buf = Vec::new();
        response.encode_versioned(&mut buf, 1).unwrap();
        assert_eq!(&buf[7..9], &[0, 17]);
        assert_eq!(&buf[9..], &[0, 3, b'b', b'a', b'd']);
    }

    #[test]
    fn test_create_topics_v1_null_message() {
        let response = CreateTopicsResponseData {
            topics: vec![CreateTopicResponseData::new("t", KafkaCode::None)],
        };
        let mut buf = Vec::new();
        response.encode_versioned(&mut buf, 1).unwrap();
        assert_eq!(&buf[buf.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_delete_topics_throttle_from_v1() {
        let response = DeleteTopicsResponseData {
            throttle_time_ms: 9,
            responses: vec![DeleteTopicResponseData {
                name: "t".to_string(),
                error_code: KafkaCode::UnknownTopicOrPartition,
            }],
        };
        let mut v0 = Vec::new();
        response.encode_versioned(&mut v0, 0).unwrap();
        assert_eq!(v0, vec![0, 0, 0, 1, 0, 1, b't', 0, 3]);

        let mut v1 = Vec::new();
        response.encode_versioned(&mut v1, 1).unwrap();
        assert_eq!(&v1[0..4], &[0, 0, 0, 9]);
        assert_eq!(&v1[4..], &v0[..]);
    }
}
