//! ApiVersions request parsing (v0-v3).

use nom::IResult;
use nombytes::NomBytes;

use crate::parser::{bytes_to_string_opt, parse_compact_nullable_string, skip_tagged_fields};

/// ApiVersions request data. The client software fields only exist in the
/// flexible v3 body.
#[derive(Debug, Clone, Default)]
pub struct ApiVersionsRequestData {
    pub client_software_name: Option<String>,
    pub client_software_version: Option<String>,
}

pub fn parse_api_versions_request(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ApiVersionsRequestData> {
    if version < 3 {
        return Ok((s, ApiVersionsRequestData::default()));
    }
    let (s, name) = parse_compact_nullable_string(s)?;
    let (s, software_version) = parse_compact_nullable_string(s)?;
    let (s, _) = skip_tagged_fields(s)?;

    Ok((
        s,
        ApiVersionsRequestData {
            client_software_name: bytes_to_string_opt(name)?,
            client_software_version: bytes_to_string_opt(software_version)?,
        },
    ))
}
