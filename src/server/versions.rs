//! Supported API version ranges.
//!
//! | API | Min | Max | Notes |
//! |-----|-----|-----|-------|
//! | Produce | 0 | 3 | transactional id from v3 |
//! | Fetch | 0 | 4 | max bytes from v3, isolation level from v4 |
//! | ListOffsets | 0 | 2 | v0 answers with an offsets array |
//! | Metadata | 0 | 1 | controller id and rack from v1 |
//! | ApiVersions | 0 | 3 | v3 body is flexible |
//! | CreateTopics | 0 | 1 | validate only from v1 |
//! | DeleteTopics | 0 | 1 | throttle time from v1 |
//!
//! Requests outside these ranges are answered with `UnsupportedVersion`.

use super::request::ApiKey;
use super::response::ApiVersionData;

/// Supported API version range for a specific API.
#[derive(Debug, Clone, Copy)]
pub struct SupportedVersion {
    /// The API key.
    pub api_key: ApiKey,
    /// Minimum supported version.
    pub min_version: i16,
    /// Maximum supported version.
    pub max_version: i16,
}

impl SupportedVersion {
    /// Create a new supported version entry.
    pub const fn new(api_key: ApiKey, min_version: i16, max_version: i16) -> Self {
        Self {
            api_key,
            min_version,
            max_version,
        }
    }

    /// Check if a specific version is supported.
    pub const fn supports(&self, version: i16) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    /// Convert to ApiVersionData for protocol response.
    pub const fn to_api_version_data(&self) -> ApiVersionData {
        ApiVersionData {
            api_key: self.api_key,
            min_version: self.min_version,
            max_version: self.max_version,
        }
    }
}

/// Every API this broker answers, in api key order.
pub const SUPPORTED_VERSIONS: &[SupportedVersion] = &[
    SupportedVersion::new(ApiKey::Produce, 0, 3),
    SupportedVersion::new(ApiKey::Fetch, 0, 4),
    SupportedVersion::new(ApiKey::ListOffsets, 0, 2),
    SupportedVersion::new(ApiKey::Metadata, 0, 1),
    SupportedVersion::new(ApiKey::ApiVersions, 0, 3),
    SupportedVersion::new(ApiKey::CreateTopics, 0, 1),
    SupportedVersion::new(ApiKey::DeleteTopics, 0, 1),
];

/// Get the default set of API version data for responses.
pub fn default_api_versions() -> Vec<ApiVersionData> {
    SUPPORTED_VERSIONS
        .iter()
        .map(|v| v.to_api_version_data())
        .collect()
}

/// Find the supported version info for a specific API key.
pub fn find_version(api_key: ApiKey) -> Option<&'static SupportedVersion> {
    SUPPORTED_VERSIONS.iter().find(|v| v.api_key == api_key)
}

/// Check if a specific API version is supported.
pub fn is_version_supported(api_key: ApiKey, version: i16) -> bool {
    find_version(api_key)
        .map(|v| v.supports(version))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_api_in_key_order() {
        let keys: Vec<i16> = SUPPORTED_VERSIONS.iter().map(|v| v.api_key.into()).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 18, 19, 20]);
        assert!(SUPPORTED_VERSIONS.iter().all(|v| v.min_version == 0));
    }

    #[test]
    fn test_ranges_accept_v0_through_max() {
        let expected = [
            (ApiKey::Produce, 3),
            (ApiKey::Fetch, 4),
            (ApiKey::ListOffsets, 2),
            (ApiKey::Metadata, 1),
            (ApiKey::ApiVersions, 3),
            (ApiKey::CreateTopics, 1),
            (ApiKey::DeleteTopics, 1),
        ];
        for (api, max) in expected {
            assert_eq!(find_version(api).unwrap().max_version, max, "{api:?}");
            for version in 0..=max {
                assert!(is_version_supported(api, version), "{api:?} v{version}");
            }
            assert!(!is_version_supported(api, max + 1), "{api:?} v{}", max + 1);
            assert!(!is_version_supported(api, -1));
        }
    }

    #[test]
    fn test_newer_versions_are_rejected() {
        assert!(!is_version_supported(ApiKey::Produce, 4));
        assert!(!is_version_supported(ApiKey::Fetch, 5));
        assert!(!is_version_supported(ApiKey::Metadata, 2));
        assert!(!is_version_supported(ApiKey::ApiVersions, 4));
        assert!(!is_version_supported(ApiKey::CreateTopics, 2));
    }

    #[test]
    fn test_unknown_api_is_unsupported() {
        assert!(find_version(ApiKey::Unknown(11)).is_none());
        assert!(!is_version_supported(ApiKey::Unknown(11), 0));
    }

    #[test]
    fn test_default_api_versions_mirror_table() {
        let versions = default_api_versions();
        assert_eq!(versions.len(), SUPPORTED_VERSIONS.len());
        let metadata = versions
            .iter()
            .find(|v| v.api_key == ApiKey::Metadata)
            .unwrap();
        assert_eq!((metadata.min_version, metadata.max_version), (0, 1));
    }
}
