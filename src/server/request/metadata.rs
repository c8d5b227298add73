//! Metadata request parsing (v0-v1).

use nom::{IResult, number::complete::be_i32};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;
use crate::parser::parse_utf8;

/// Metadata request data.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequestData {
    /// The topics to fetch metadata for. None means all topics.
    pub topics: Option<Vec<String>>,
}

/// v0 asks for every topic with an empty array, v1 with a null one.
pub fn parse_metadata_request(s: NomBytes, version: i16) -> IResult<NomBytes, MetadataRequestData> {
    let (s, topic_count) = be_i32(s)?;
    if topic_count == -1 || (version == 0 && topic_count == 0) {
        return Ok((s, MetadataRequestData { topics: None }));
    }
    if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&topic_count) {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let mut topics = Vec::with_capacity(topic_count as usize);
    let mut remaining = s;
    for _ in 0..topic_count {
        let (s, name) = parse_utf8(remaining)?;
        topics.push(name);
        remaining = s;
    }

    Ok((
        remaining,
        MetadataRequestData {
            topics: Some(topics),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn nb(buf: Vec<u8>) -> NomBytes {
        NomBytes::new(Bytes::from(buf))
    }

    #[test]
    fn test_v0_empty_array_means_all_topics() {
        let (_, req) = parse_metadata_request(nb(0i32.to_be_bytes().to_vec()), 0).unwrap();
        assert!(req.topics.is_none());
    }

    #[test]
    fn test_v1_empty_array_means_no_topics() {
        let (_, req) = parse_metadata_request(nb(0i32.to_be_bytes().to_vec()), 1).unwrap();
        assert_eq!(req.topics, Some(vec![]));
    }

    #[test]
    fn test_v1_null_means_all_topics() {
        let (_, req) = parse_metadata_request(nb((-1i32).to_be_bytes().to_vec()), 1).unwrap();
        assert!(req.topics.is_none());
    }

    #[test]
    fn test_named_topics() {
        let mut buf = Vec::new();
        buf.put_i32(2);
        buf.put_i16(1);
        buf.put_slice(b"a");
        buf.put_i16(2);
        buf.put_slice(b"bc");
        let (_, req) = parse_metadata_request(nb(buf), 0).unwrap();
        assert_eq!(req.topics, Some(vec!["a".to_string(), "bc".to_string()]));
    }

    #[test]
    fn test_negative_count_rejected() {
        assert!(parse_metadata_request(nb((-5i32).to_be_bytes().to_vec()), 1).is_err());
    }
}
