//! Request parsing for incoming Kafka protocol messages.
//!
//! Every frame starts with a header:
//!
//! ```text
//! [i16 api_key][i16 api_version][i32 correlation_id][nullable string client_id]
//! ```
//!
//! followed by the API-specific body. Bodies are parsed per version; a
//! request for an API or version outside [`super::versions::SUPPORTED_VERSIONS`]
//! is returned as [`Request::Unsupported`] without touching the body, and a
//! body that fails to decode as [`Request::Malformed`].

mod admin;
mod fetch;
mod metadata;
mod offsets;
mod produce;
mod versions;

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::error::{Error, Result};
use crate::parser::{bytes_to_string_opt, parse_nullable_string, skip_tagged_fields};

pub use admin::*;
pub use fetch::*;
pub use metadata::*;
pub use offsets::*;
pub use produce::*;
pub use versions::*;

/// API keys for Kafka protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    ApiVersions,
    CreateTopics,
    DeleteTopics,
    Unknown(i16),
}

impl From<i16> for ApiKey {
    fn from(value: i16) -> Self {
        match value {
            0 => ApiKey::Produce,
            1 => ApiKey::Fetch,
            2 => ApiKey::ListOffsets,
            3 => ApiKey::Metadata,
            18 => ApiKey::ApiVersions,
            19 => ApiKey::CreateTopics,
            20 => ApiKey::DeleteTopics,
            n => ApiKey::Unknown(n),
        }
    }
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::ListOffsets => 2,
            ApiKey::Metadata => 3,
            ApiKey::ApiVersions => 18,
            ApiKey::CreateTopics => 19,
            ApiKey::DeleteTopics => 20,
            ApiKey::Unknown(n) => n,
        }
    }
}

impl ApiKey {
    /// Static name used as a metrics label.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKey::Produce => "Produce",
            ApiKey::Fetch => "Fetch",
            ApiKey::ListOffsets => "ListOffsets",
            ApiKey::Metadata => "Metadata",
            ApiKey::ApiVersions => "ApiVersions",
            ApiKey::CreateTopics => "CreateTopics",
            ApiKey::DeleteTopics => "DeleteTopics",
            ApiKey::Unknown(_) => "Unknown",
        }
    }
}

/// Parsed request header from incoming Kafka messages.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

/// Parse a request header.
///
/// ApiVersions v3 keeps the classic `client_id` encoding but is followed by
/// an (empty) tagged field section.
pub fn parse_request_header(s: NomBytes) -> IResult<NomBytes, RequestHeader> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parse_nullable_string(s)?;

    let api_key = ApiKey::from(api_key);
    let s = if api_key == ApiKey::ApiVersions && api_version >= 3 {
        skip_tagged_fields(s)?.0
    } else {
        s
    };

    Ok((
        s,
        RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id: bytes_to_string_opt(client_id)?,
        },
    ))
}

/// Parsed Kafka request with header and body.
#[derive(Debug)]
pub enum Request {
    ApiVersions(RequestHeader, ApiVersionsRequestData),
    Produce(RequestHeader, ProduceRequestData),
    Fetch(RequestHeader, FetchRequestData),
    ListOffsets(RequestHeader, ListOffsetsRequestData),
    Metadata(RequestHeader, MetadataRequestData),
    CreateTopics(RequestHeader, CreateTopicsRequestData),
    DeleteTopics(RequestHeader, DeleteTopicsRequestData),
    /// Unknown API key or unsupported version; the body is left unparsed.
    Unsupported(RequestHeader, Bytes),
    /// Supported API and version whose body failed to decode.
    Malformed(RequestHeader),
}

impl Request {
    pub fn header(&self) -> &RequestHeader {
        match self {
            Request::ApiVersions(h, _)
            | Request::Produce(h, _)
            | Request::Fetch(h, _)
            | Request::ListOffsets(h, _)
            | Request::Metadata(h, _)
            | Request::CreateTopics(h, _)
            | Request::DeleteTopics(h, _)
            | Request::Unsupported(h, _)
            | Request::Malformed(h) => h,
        }
    }

    /// Parse a request frame (without its size prefix).
    ///
    /// Only an undecodable header is an error. A body that does not decode
    /// yields [`Request::Malformed`] so the caller can still answer it.
    pub fn parse(data: Bytes) -> Result<Self> {
        let input = NomBytes::new(data.clone());
        let (remaining, header) =
            parse_request_header(input).map_err(|_| Error::ParsingError(data))?;

        if !super::versions::is_version_supported(header.api_key, header.api_version) {
            return Ok(Request::Unsupported(header, remaining.into_bytes()));
        }

        let version = header.api_version;
        let request = match header.api_key {
            ApiKey::ApiVersions => with_body(
                header,
                parse_api_versions_request(remaining, version),
                Request::ApiVersions,
            ),
            ApiKey::Produce => with_body(
                header,
                parse_produce_request(remaining, version),
                Request::Produce,
            ),
            ApiKey::Fetch => with_body(
                header,
                parse_fetch_request(remaining, version),
                Request::Fetch,
            ),
            ApiKey::ListOffsets => with_body(
                header,
                parse_list_offsets_request(remaining, version),
                Request::ListOffsets,
            ),
            ApiKey::Metadata => with_body(
                header,
                parse_metadata_request(remaining, version),
                Request::Metadata,
            ),
            ApiKey::CreateTopics => with_body(
                header,
                parse_create_topics_request(remaining, version),
                Request::CreateTopics,
            ),
            ApiKey::DeleteTopics => with_body(
                header,
                parse_delete_topics_request(remaining, version),
                Request::DeleteTopics,
            ),
            ApiKey::Unknown(_) => Request::Unsupported(header, remaining.into_bytes()),
        };
        Ok(request)
    }
}

fn with_body<T>(
    header: RequestHeader,
    parsed: IResult<NomBytes, T>,
    wrap: fn(RequestHeader, T) -> Request,
) -> Request {
    match parsed {
        Ok((_, body)) => wrap(header, body),
        Err(_) => Request::Malformed(header),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(
        api_key: i16,
        api_version: i16,
        correlation_id: i32,
        client_id: Option<&str>,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&api_key.to_be_bytes());
        data.extend_from_slice(&api_version.to_be_bytes());
        data.extend_from_slice(&correlation_id.to_be_bytes());
        match client_id {
            Some(s) => {
                data.extend_from_slice(&(s.len() as i16).to_be_bytes());
                data.extend_from_slice(s.as_bytes());
            }
            None => data.extend_from_slice(&(-1i16).to_be_bytes()),
        }
        data
    }

    #[test]
    fn test_api_key_from_i16() {
        assert_eq!(ApiKey::from(0), ApiKey::Produce);
        assert_eq!(ApiKey::from(1), ApiKey::Fetch);
        assert_eq!(ApiKey::from(2), ApiKey::ListOffsets);
        assert_eq!(ApiKey::from(3), ApiKey::Metadata);
        assert_eq!(ApiKey::from(18), ApiKey::ApiVersions);
        assert_eq!(ApiKey::from(19), ApiKey::CreateTopics);
        assert_eq!(ApiKey::from(20), ApiKey::DeleteTopics);
        assert_eq!(ApiKey::from(11), ApiKey::Unknown(11));
    }

    #[test]
    fn test_api_key_roundtrip() {
        for i in -1..=60 {
            assert_eq!(i16::from(ApiKey::from(i)), i);
        }
    }

    #[test]
    fn test_parse_request_header() {
        let data = build_header(18, 2, 12345, Some("test-client"));
        let (_, header) = parse_request_header(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(header.api_key, ApiKey::ApiVersions);
        assert_eq!(header.api_version, 2);
        assert_eq!(header.correlation_id, 12345);
        assert_eq!(header.client_id.as_deref(), Some("test-client"));
    }

    #[test]
    fn test_parse_api_versions_v3_skips_header_tags() {
        let mut data = build_header(18, 3, 7, Some("c"));
        data.push(0x00); // header tagged fields
        data.push(0x00); // null software name
        data.push(0x00); // null software version
        data.push(0x00); // body tagged fields
        match Request::parse(Bytes::from(data)).unwrap() {
            Request::ApiVersions(h, body) => {
                assert_eq!(h.correlation_id, 7);
                assert!(body.client_software_name.is_none());
            }
            other => panic!("expected ApiVersions, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_api_is_unsupported() {
        let mut data = build_header(11, 0, 5, None);
        data.extend_from_slice(b"group");
        match Request::parse(Bytes::from(data)).unwrap() {
            Request::Unsupported(h, body) => {
                assert_eq!(h.api_key, ApiKey::Unknown(11));
                assert_eq!(&body[..], b"group");
            }
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_version_is_not_parsed() {
        // Produce v9 is flexible; the body would not parse as v3.
        let mut data = build_header(0, 9, 5, None);
        data.extend_from_slice(&[0xde, 0xad]);
        let request = Request::parse(Bytes::from(data)).unwrap();
        assert!(matches!(request, Request::Unsupported(ref h, _) if h.api_version == 9));
    }

    #[test]
    fn test_truncated_header_is_parse_error() {
        let err = Request::parse(Bytes::from_static(&[0, 1, 0])).unwrap_err();
        assert!(matches!(err, Error::ParsingError(_)));
    }

    #[test]
    fn test_truncated_body_keeps_header() {
        let mut data = build_header(1, 0, 5, None);
        data.extend_from_slice(&[0, 0, 0, 1]); // replica id only
        match Request::parse(Bytes::from(data)).unwrap() {
            Request::Malformed(header) => {
                assert_eq!(header.api_key, ApiKey::Fetch);
                assert_eq!(header.correlation_id, 5);
            }
            other => panic!("expected a malformed request, got {other:?}"),
        }
    }
}
