//! Admin request parsing (CreateTopics, DeleteTopics).

use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_u8},
};
use nombytes::NomBytes;

use crate::parser::{parse_array, parse_nullable_string, parse_string, parse_utf8};

// ============================================================================
// CreateTopics
// ============================================================================

/// CreateTopics request data.
#[derive(Debug, Clone)]
pub struct CreateTopicsRequestData {
    pub topics: Vec<CreateTopicData>,
    pub timeout_ms: i32,
    /// v1+: check the request without creating anything.
    pub validate_only: bool,
}

#[derive(Debug, Clone)]
pub struct CreateTopicData {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    /// Manual replica assignments are not supported; the handler rejects
    /// topics that carry any.
    pub has_assignments: bool,
}

pub fn parse_create_topics_request(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, CreateTopicsRequestData> {
    let (s, topics) = parse_array(parse_create_topic)(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let (s, validate_only) = if version >= 1 {
        let (s, b) = be_u8(s)?;
        (s, b != 0)
    } else {
        (s, false)
    };

    Ok((
        s,
        CreateTopicsRequestData {
            topics,
            timeout_ms,
            validate_only,
        },
    ))
}

fn parse_create_topic(s: NomBytes) -> IResult<NomBytes, CreateTopicData> {
    let (s, name) = parse_utf8(s)?;
    let (s, num_partitions) = be_i32(s)?;
    let (s, replication_factor) = be_i16(s)?;
    let (s, assignments) = parse_array(|s| {
        let (s, _) = be_i32(s)?;
        let (s, _) = parse_array(be_i32)(s)?;
        Ok((s, ()))
    })(s)?;
    // Topic configs are accepted and ignored.
    let (s, _configs) = parse_array(|s| {
        let (s, _) = parse_string(s)?;
        let (s, _) = parse_nullable_string(s)?;
        Ok((s, ()))
    })(s)?;

    Ok((
        s,
        CreateTopicData {
            name,
            num_partitions,
            replication_factor,
            has_assignments: !assignments.is_empty(),
        },
    ))
}

// ============================================================================
// DeleteTopics
// ============================================================================

/// DeleteTopics request data (identical layout in v0 and v1).
#[derive(Debug, Clone)]
pub struct DeleteTopicsRequestData {
    pub topic_names: Vec<String>,
    pub timeout_ms: i32,
}

pub fn parse_delete_topics_request(
    s: NomBytes,
    _version: i16,
) -> IResult<NomBytes, DeleteTopicsRequestData> {
    let (s, topic_names) = parse_array(parse_utf8)(s)?;
    let (s, timeout_ms) = be_i32(s)?;

    Ok((
        s,
        DeleteTopicsRequestData {
            topic_names,
            timeout_ms,
        },
    ))
}
