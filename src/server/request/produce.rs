//! Produce request parsing (v0-v3).

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::parser::{
    bytes_to_string_opt, parse_array, parse_nullable_bytes, parse_nullable_string, parse_utf8,
};

/// Produce request data.
#[derive(Debug, Clone)]
pub struct ProduceRequestData {
    /// Only present from v3.
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone)]
pub struct ProducePartitionData {
    pub partition_index: i32,
    /// Raw record set; a null record set is read as empty.
    pub records: Bytes,
}

pub fn parse_produce_request(s: NomBytes, version: i16) -> IResult<NomBytes, ProduceRequestData> {
    let (s, transactional_id) = if version >= 3 {
        parse_nullable_string(s)?
    } else {
        (s, None)
    };
    let (s, acks) = be_i16(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let (s, topics) = parse_array(parse_produce_topic)(s)?;

    Ok((
        s,
        ProduceRequestData {
            transactional_id: bytes_to_string_opt(transactional_id)?,
            acks,
            timeout_ms,
            topics,
        },
    ))
}

fn parse_produce_topic(s: NomBytes) -> IResult<NomBytes, ProduceTopicData> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_produce_partition)(s)?;
    Ok((s, ProduceTopicData { name, partitions }))
}

fn parse_produce_partition(s: NomBytes) -> IResult<NomBytes, ProducePartitionData> {
    let (s, partition_index) = be_i32(s)?;
    let (s, records) = parse_nullable_bytes(s)?;

    Ok((
        s,
        ProducePartitionData {
            partition_index,
            records: records.unwrap_or_default(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn body(version: i16, records: &[u8]) -> NomBytes {
        let mut buf = Vec::new();
        if version >= 3 {
            buf.put_i16(-1); // transactional_id = null
        }
        buf.put_i16(-1); // acks
        buf.put_i32(1500); // timeout
        buf.put_i32(1); // topics
        buf.put_i16(6);
        buf.put_slice(b"orders");
        buf.put_i32(1); // partitions
        buf.put_i32(2);
        buf.put_i32(records.len() as i32);
        buf.put_slice(records);
        NomBytes::new(Bytes::from(buf))
    }

    #[test]
    fn test_parse_v0_has_no_transactional_id() {
        let (rest, req) = parse_produce_request(body(0, b"abc"), 0).unwrap();
        assert!(rest.into_bytes().is_empty());
        assert_eq!(req.transactional_id, None);
        assert_eq!(req.acks, -1);
        assert_eq!(req.timeout_ms, 1500);
        assert_eq!(req.topics[0].name, "orders");
        assert_eq!(req.topics[0].partitions[0].partition_index, 2);
        assert_eq!(&req.topics[0].partitions[0].records[..], b"abc");
    }

    #[test]
    fn test_parse_v3_reads_transactional_id() {
        let (rest, req) = parse_produce_request(body(3, b"xyz"), 3).unwrap();
        assert!(rest.into_bytes().is_empty());
        assert_eq!(req.acks, -1);
        assert_eq!(&req.topics[0].partitions[0].records[..], b"xyz");
    }

    #[test]
    fn test_truncated_records_fail() {
        let mut buf = Vec::new();
        buf.put_i16(1);
        buf.put_i32(1000);
        buf.put_i32(1);
        buf.put_i16(1);
        buf.put_slice(b"t");
        buf.put_i32(1);
        buf.put_i32(0);
        buf.put_i32(100); // claims 100 bytes
        buf.put_slice(b"short");
        assert!(parse_produce_request(NomBytes::new(Bytes::from(buf)), 0).is_err());
    }
}
