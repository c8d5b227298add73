//! ListOffsets request parsing (v0-v2).

use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64},
};
use nombytes::NomBytes;

use crate::parser::{parse_array, parse_utf8};

/// ListOffsets request data.
#[derive(Debug, Clone)]
pub struct ListOffsetsRequestData {
    pub replica_id: i32,
    /// From v2.
    pub isolation_level: i8,
    pub topics: Vec<ListOffsetsTopicData>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopicData {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionData>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsPartitionData {
    pub partition_index: i32,
    /// -1 for the latest offset, -2 for the earliest, otherwise a timestamp
    /// in milliseconds.
    pub timestamp: i64,
    /// v0 only.
    pub max_num_offsets: i32,
}

pub fn parse_list_offsets_request(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsRequestData> {
    let (s, replica_id) = be_i32(s)?;
    let (s, isolation_level) = if version >= 2 { be_i8(s)? } else { (s, 0i8) };
    let (s, topics) = parse_array(|s| parse_list_offsets_topic(s, version))(s)?;

    Ok((
        s,
        ListOffsetsRequestData {
            replica_id,
            isolation_level,
            topics,
        },
    ))
}

fn parse_list_offsets_topic(s: NomBytes, version: i16) -> IResult<NomBytes, ListOffsetsTopicData> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(|s| parse_list_offsets_partition(s, version))(s)?;
    Ok((s, ListOffsetsTopicData { name, partitions }))
}

fn parse_list_offsets_partition(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsPartitionData> {
    let (s, partition_index) = be_i32(s)?;
    let (s, timestamp) = be_i64(s)?;
    let (s, max_num_offsets) = if version == 0 { be_i32(s)? } else { (s, 1) };

    Ok((
        s,
        ListOffsetsPartitionData {
            partition_index,
            timestamp,
            max_num_offsets,
        },
    ))
}
