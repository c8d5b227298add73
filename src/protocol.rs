//! Record batch utilities.
//!
//! Produce requests carry a *record set*: a concatenation of entries that each
//! start with `base_offset: i64` and `length: i32`. For the v2 format an entry
//! is a RecordBatch (see [`crate::constants::RECORD_BATCH_HEADER_SIZE`] for
//! the header layout) that covers `last_offset_delta + 1` offsets. Legacy
//! (magic 0/1) entries are single messages and cover one offset.
//!
//! The partition log stores entries exactly as they travel on the wire, so the
//! helpers here are shared by the produce path, the log recovery scan and the
//! replication apply path.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i8, be_i16, be_i32, be_i64, be_u32},
};
use nombytes::NomBytes;
use thiserror::Error;

use crate::constants::{
    BATCH_ATTRIBUTES_OFFSET, BATCH_BASE_OFFSET, BATCH_CRC_DATA_START, BATCH_CRC_OFFSET,
    BATCH_LAST_OFFSET_DELTA_OFFSET, BATCH_LENGTH_OFFSET, BATCH_MAGIC_OFFSET,
    BATCH_MAX_TIMESTAMP_OFFSET, LOG_OVERHEAD, RECORD_BATCH_HEADER_SIZE, RECORD_BATCH_MAGIC,
};
use crate::encode::{encode_varint, encode_varlong};
use crate::parser::{parse_varint, parse_varlong};

// CRC-32C (Castagnoli), the checksum used by v2 record batches.
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute a CRC-32C checksum.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// Errors found while walking a record set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record set truncated at byte {position}")]
    Truncated { position: usize },

    #[error("invalid entry length {length} at byte {position}")]
    InvalidLength { position: usize, length: i32 },

    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("unsupported record format: {0}")]
    Unsupported(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Result of CRC validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcValidationResult {
    Valid,
    Invalid { expected: u32, actual: u32 },
    /// Batch is too small to contain CRC.
    TooSmall,
    /// Legacy message formats are not checked.
    NotApplicable,
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_be_bytes(raw)
}

/// Base offset stored in an entry header.
pub fn base_offset(entry: &[u8]) -> i64 {
    read_i64(entry, BATCH_BASE_OFFSET)
}

/// Magic byte of an entry, if the header is long enough to carry one.
pub fn magic(entry: &[u8]) -> Option<i8> {
    entry.get(BATCH_MAGIC_OFFSET).map(|b| *b as i8)
}

/// Validate the CRC-32C of a v2 batch. The stored CRC sits at bytes 17..21
/// and covers everything from the attributes field to the end of the batch.
pub fn validate_batch_crc(batch: &[u8]) -> CrcValidationResult {
    if batch.len() < BATCH_CRC_DATA_START {
        return CrcValidationResult::TooSmall;
    }
    if magic(batch) != Some(RECORD_BATCH_MAGIC) {
        return CrcValidationResult::NotApplicable;
    }
    let stored = read_i32(batch, BATCH_CRC_OFFSET) as u32;
    let computed = crc32c(&batch[BATCH_CRC_DATA_START..]);
    if stored == computed {
        CrcValidationResult::Valid
    } else {
        CrcValidationResult::Invalid {
            expected: stored,
            actual: computed,
        }
    }
}

/// Number of offsets an entry occupies.
pub fn record_count(entry: &[u8]) -> i64 {
    if magic(entry) == Some(RECORD_BATCH_MAGIC) && entry.len() >= RECORD_BATCH_HEADER_SIZE {
        i64::from(read_i32(entry, BATCH_LAST_OFFSET_DELTA_OFFSET)) + 1
    } else {
        1
    }
}

/// Largest timestamp in a v2 batch. `None` for legacy entries.
pub fn max_timestamp(entry: &[u8]) -> Option<i64> {
    (magic(entry) == Some(RECORD_BATCH_MAGIC) && entry.len() >= RECORD_BATCH_HEADER_SIZE)
        .then(|| read_i64(entry, BATCH_MAX_TIMESTAMP_OFFSET))
}

/// Overwrite the base offset of an entry. The base offset lies outside the
/// CRC-covered region so the checksum stays valid.
pub fn patch_base_offset(entry: &mut [u8], base_offset: i64) {
    if entry.len() >= 8 {
        entry[BATCH_BASE_OFFSET..BATCH_BASE_OFFSET + 8].copy_from_slice(&base_offset.to_be_bytes());
    }
}

/// Total size of the entry starting at `buf[0]`, or `None` if the header
/// itself is incomplete.
pub fn entry_size(buf: &[u8]) -> Option<Result<usize, i32>> {
    if buf.len() < LOG_OVERHEAD {
        return None;
    }
    let length = read_i32(buf, BATCH_LENGTH_OFFSET);
    if length < 0 {
        return Some(Err(length));
    }
    Some(Ok(LOG_OVERHEAD + length as usize))
}

/// Split a record set into its entries. Every entry is validated for framing
/// and, for v2 batches, for CRC.
pub fn split_entries(records: &Bytes) -> Result<Vec<Bytes>, RecordError> {
    let mut entries = Vec::new();
    let mut position = 0usize;
    while position < records.len() {
        let rest = &records[position..];
        let size = match entry_size(rest) {
            None => return Err(RecordError::Truncated { position }),
            Some(Err(length)) => return Err(RecordError::InvalidLength { position, length }),
            Some(Ok(size)) => size,
        };
        if size > rest.len() {
            return Err(RecordError::Truncated { position });
        }
        let entry = records.slice(position..position + size);
        if let CrcValidationResult::Invalid { expected, actual } = validate_batch_crc(&entry) {
            return Err(RecordError::CrcMismatch {
                stored: expected,
                computed: actual,
            });
        }
        entries.push(entry);
        position += size;
    }
    Ok(entries)
}

/// A single decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Option<Bytes>)>,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Option<Bytes>, timestamp: i64) -> Self {
        Self {
            offset: 0,
            timestamp,
            key,
            value,
            headers: Vec::new(),
        }
    }
}

fn put_varint_bytes(buf: &mut BytesMut, data: Option<&Bytes>) {
    match data {
        Some(d) => {
            encode_varint(buf, d.len() as i32);
            buf.put_slice(d);
        }
        None => encode_varint(buf, -1),
    }
}

/// Build an uncompressed v2 record batch. Offsets inside the batch are
/// relative to `base_offset`; each record's own `offset` field is ignored.
pub fn encode_record_batch(base_offset: i64, records: &[Record]) -> Bytes {
    let first_timestamp = records.first().map(|r| r.timestamp).unwrap_or(-1);
    let max_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(-1);

    let mut body = BytesMut::new();
    for (delta, record) in records.iter().enumerate() {
        let mut rec = BytesMut::new();
        rec.put_i8(0);
        encode_varlong(&mut rec, record.timestamp - first_timestamp);
        encode_varint(&mut rec, delta as i32);
        put_varint_bytes(&mut rec, record.key.as_ref());
        put_varint_bytes(&mut rec, record.value.as_ref());
        encode_varint(&mut rec, record.headers.len() as i32);
        for (name, value) in &record.headers {
            encode_varint(&mut rec, name.len() as i32);
            rec.put_slice(name.as_bytes());
            put_varint_bytes(&mut rec, value.as_ref());
        }
        encode_varint(&mut body, rec.len() as i32);
        body.put_slice(&rec);
    }

    let mut batch = BytesMut::with_capacity(RECORD_BATCH_HEADER_SIZE + body.len());
    batch.put_i64(base_offset);
    batch.put_i32((RECORD_BATCH_HEADER_SIZE - LOG_OVERHEAD + body.len()) as i32);
    batch.put_i32(-1); // partition leader epoch
    batch.put_i8(RECORD_BATCH_MAGIC);
    batch.put_u32(0); // crc placeholder
    batch.put_i16(0); // attributes: no compression, create time
    batch.put_i32(records.len().saturating_sub(1) as i32);
    batch.put_i64(first_timestamp);
    batch.put_i64(max_timestamp);
    batch.put_i64(-1); // producer id
    batch.put_i16(-1); // producer epoch
    batch.put_i32(-1); // first sequence
    batch.put_i32(records.len() as i32);
    batch.put_slice(&body);

    let crc = crc32c(&batch[BATCH_CRC_DATA_START..]);
    batch[BATCH_CRC_OFFSET..BATCH_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
    batch.freeze()
}

fn parse_varint_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, len) = parse_varint(s)?;
    if len < 0 {
        return Ok((s, None));
    }
    let (s, data) = take(len as usize)(s)?;
    Ok((s, Some(data.into_bytes())))
}

fn parse_record(s: NomBytes, base_offset: i64, first_timestamp: i64) -> IResult<NomBytes, Record> {
    let (s, _length) = parse_varint(s)?;
    let (s, _attributes) = be_i8(s)?;
    let (s, timestamp_delta) = parse_varlong(s)?;
    let (s, offset_delta) = parse_varint(s)?;
    let (s, key) = parse_varint_bytes(s)?;
    let (s, value) = parse_varint_bytes(s)?;
    let (mut s, header_count) = parse_varint(s)?;
    let mut headers = Vec::with_capacity(header_count.max(0) as usize);
    for _ in 0..header_count.max(0) {
        let (rest, name) = parse_varint_bytes(s)?;
        let (rest, value) = parse_varint_bytes(rest)?;
        let name = name
            .map(|n| String::from_utf8_lossy(&n).into_owned())
            .unwrap_or_default();
        headers.push((name, value));
        s = rest;
    }
    Ok((
        s,
        Record {
            offset: base_offset + i64::from(offset_delta),
            timestamp: first_timestamp + timestamp_delta,
            key,
            value,
            headers,
        },
    ))
}

fn parse_batch_records(s: NomBytes) -> IResult<NomBytes, Vec<Record>> {
    let (s, base_offset) = be_i64(s)?;
    let (s, _length) = be_i32(s)?;
    let (s, _leader_epoch) = be_i32(s)?;
    let (s, _magic) = be_i8(s)?;
    let (s, _crc) = be_u32(s)?;
    let (s, _attributes) = be_i16(s)?;
    let (s, _last_offset_delta) = be_i32(s)?;
    let (s, first_timestamp) = be_i64(s)?;
    let (s, _max_timestamp) = be_i64(s)?;
    let (s, _producer_id) = be_i64(s)?;
    let (s, _producer_epoch) = be_i16(s)?;
    let (s, _first_sequence) = be_i32(s)?;
    let (mut s, count) = be_i32(s)?;
    let mut records = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        let (rest, record) = parse_record(s, base_offset, first_timestamp)?;
        records.push(record);
        s = rest;
    }
    Ok((s, records))
}

/// Decode every record of an uncompressed v2 record set.
pub fn decode_records(records: &Bytes) -> Result<Vec<Record>, RecordError> {
    let mut out = Vec::new();
    for entry in split_entries(records)? {
        if magic(&entry) != Some(RECORD_BATCH_MAGIC) {
            return Err(RecordError::Unsupported("legacy message format".into()));
        }
        let attributes = i16::from_be_bytes([
            entry[BATCH_ATTRIBUTES_OFFSET],
            entry[BATCH_ATTRIBUTES_OFFSET + 1],
        ]);
        if attributes & 0x07 != 0 {
            return Err(RecordError::Unsupported(format!(
                "compression codec {}",
                attributes & 0x07
            )));
        }
        let (_, batch) = parse_batch_records(NomBytes::new(entry))
            .map_err(|e| RecordError::Malformed(format!("{e:?}")))?;
        out.extend(batch);
    }
    Ok(out)
}
