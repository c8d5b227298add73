//! Deserialize values from the Kafka wire format.
//!
//! All parsers operate on [`NomBytes`] so that record payloads can be sliced
//! out of the request buffer without copying.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    error::{ErrorKind, ParseError},
    multi::many_m_n,
    number::complete::{be_i16, be_i32, be_u8},
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;

type ParseErr = nom::Err<nom::error::Error<NomBytes>>;

fn failure(s: NomBytes, kind: ErrorKind) -> ParseErr {
    nom::Err::Failure(nom::error::Error::new(s, kind))
}

/// Convert bytes to a validated UTF-8 string.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, ParseErr> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| failure(NomBytes::from(bytes.as_ref()), ErrorKind::Verify))
}

/// Convert optional bytes to a validated UTF-8 string.
pub fn bytes_to_string_opt(bytes: Option<Bytes>) -> Result<Option<String>, ParseErr> {
    bytes.as_ref().map(bytes_to_string).transpose()
}

/// STRING: i16 length followed by that many bytes. Negative lengths are rejected.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i16(s)?;
    if length < 0 {
        return Err(failure(s, ErrorKind::LengthValue));
    }
    let (s, string) = take(length as usize)(s)?;
    Ok((s, string.into_bytes()))
}

/// STRING decoded straight into an owned UTF-8 `String`.
pub fn parse_utf8(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, raw) = parse_string(s)?;
    Ok((s, bytes_to_string(&raw)?))
}

/// NULLABLE_STRING: i16 length, -1 meaning null.
pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;
    match length {
        -1 => Ok((s, None)),
        n if n < 0 => Err(failure(s, ErrorKind::LengthValue)),
        n => {
            let (s, string) = take(n as usize)(s)?;
            Ok((s, Some(string.into_bytes())))
        }
    }
}

/// NULLABLE_BYTES: i32 length, -1 meaning null.
pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    match length {
        -1 => Ok((s, None)),
        n if n < 0 => Err(failure(s, ErrorKind::LengthValue)),
        n => {
            let (s, data) = take(n as usize)(s)?;
            Ok((s, Some(data.into_bytes())))
        }
    }
}

/// ARRAY: i32 count followed by `count` elements. A null array (-1) is
/// returned as empty; counts above `MAX_PROTOCOL_ARRAY_SIZE` are rejected.
pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;
        if length == -1 {
            return Ok((i, vec![]));
        }
        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(i, ErrorKind::TooLarge)));
        }
        many_m_n(length as usize, length as usize, f)(i)
    }
}

/// Unsigned LEB128 varint, at most 10 bytes.
pub fn parse_unsigned_varint(s: NomBytes) -> IResult<NomBytes, u64> {
    let mut result: u64 = 0;
    let mut remaining = s;
    for shift in (0..70).step_by(7) {
        let (s, b) = be_u8(remaining)?;
        remaining = s;
        result |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((remaining, result));
        }
    }
    Err(failure(remaining, ErrorKind::TooLarge))
}

/// Zig-zag encoded signed varint (i32 range).
pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, i32> {
    let (s, raw) = parse_unsigned_varint(s)?;
    let raw = u32::try_from(raw).map_err(|_| failure(s.clone(), ErrorKind::TooLarge))?;
    Ok((s, ((raw >> 1) as i32) ^ -((raw & 1) as i32)))
}

/// Zig-zag encoded signed varlong.
pub fn parse_varlong(s: NomBytes) -> IResult<NomBytes, i64> {
    let (s, raw) = parse_unsigned_varint(s)?;
    Ok((s, ((raw >> 1) as i64) ^ -((raw & 1) as i64)))
}

/// COMPACT_NULLABLE_STRING: unsigned varint of `len + 1`, zero meaning null.
pub fn parse_compact_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = parse_unsigned_varint(s)?;
    if length == 0 {
        return Ok((s, None));
    }
    let (s, string) = take((length - 1) as usize)(s)?;
    Ok((s, Some(string.into_bytes())))
}

/// Skip a tagged field section: varint count, then `(tag, size, bytes)` triples.
pub fn skip_tagged_fields(s: NomBytes) -> IResult<NomBytes, ()> {
    let (mut s, count) = parse_unsigned_varint(s)?;
    for _ in 0..count {
        let (remaining, _tag) = parse_unsigned_varint(s)?;
        let (remaining, size) = parse_unsigned_varint(remaining)?;
        let (remaining, _) = take(size as usize)(remaining)?;
        s = remaining;
    }
    Ok((s, ()))
}
