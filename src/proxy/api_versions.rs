//! The canned `ApiVersions` response.
//!
//! When authentication offload is on, the proxy answers `ApiVersions`
//! itself, before any upstream connection exists, so it needs a response of
//! its own. The advertised ranges are pinned here rather than derived from
//! whatever broker the connection later lands on; this is the single piece
//! of process-wide state the data plane has, built once on first use.

use kafka_protocol::messages::api_versions_response::{ApiVersion, ApiVersionsResponse};
use kafka_protocol::messages::{ApiKey, ResponseHeader};
use once_cell::sync::Lazy;

use crate::proxy::frame::DecodedResponseFrame;

/// Advertised `(api, min, max)` ranges.
///
/// Kept to versions the codecs handle end to end. When raising a max here,
/// confirm the schema source supports the new version first.
const SUPPORTED: &[(ApiKey, i16, i16)] = &[
    (ApiKey::Produce, 0, 9),
    (ApiKey::Fetch, 0, 13),
    (ApiKey::ListOffsets, 0, 7),
    (ApiKey::Metadata, 0, 12),
    (ApiKey::OffsetCommit, 0, 8),
    (ApiKey::OffsetFetch, 0, 8),
    (ApiKey::FindCoordinator, 0, 4),
    (ApiKey::JoinGroup, 0, 9),
    (ApiKey::Heartbeat, 0, 4),
    (ApiKey::LeaveGroup, 0, 5),
    (ApiKey::SyncGroup, 0, 5),
    (ApiKey::DescribeGroups, 0, 5),
    (ApiKey::ListGroups, 0, 4),
    (ApiKey::SaslHandshake, 0, 1),
    (ApiKey::ApiVersions, 0, 3),
    (ApiKey::CreateTopics, 0, 7),
    (ApiKey::DeleteTopics, 0, 6),
    (ApiKey::DeleteRecords, 0, 2),
    (ApiKey::InitProducerId, 0, 4),
    (ApiKey::SaslAuthenticate, 0, 2),
    (ApiKey::CreatePartitions, 0, 3),
    (ApiKey::DeleteGroups, 0, 2),
    (ApiKey::DescribeCluster, 0, 1),
];

static CANNED: Lazy<ApiVersionsResponse> = Lazy::new(|| {
    let mut response = ApiVersionsResponse::default();
    response.error_code = 0;
    for &(api, min, max) in SUPPORTED {
        let mut range = ApiVersion::default();
        range.api_key = api as i16;
        range.min_version = min;
        range.max_version = max;
        response.api_keys.push(range);
    }
    response
});

/// The canned response body.
pub fn canned_response() -> ApiVersionsResponse {
    CANNED.clone()
}

/// The canned response framed for a specific request. The response header
/// is v0 regardless of `api_version` (KIP-511); the codec layer pins that.
pub fn canned_frame(api_version: i16, correlation_id: i32) -> DecodedResponseFrame {
    DecodedResponseFrame {
        api_key: ApiKey::ApiVersions as i16,
        api_version,
        correlation_id,
        header: ResponseHeader::default().with_correlation_id(correlation_id),
        body: kafka_protocol::messages::ResponseKind::ApiVersions(canned_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_response_is_well_formed() {
        let response = canned_response();
        assert_eq!(response.error_code, 0);
        assert!(!response.api_keys.is_empty());

        let api_versions = response
            .api_keys
            .iter()
            .find(|v| v.api_key == ApiKey::ApiVersions as i16)
            .expect("ApiVersions must advertise itself");
        assert_eq!(api_versions.min_version, 0);
        assert_eq!(api_versions.max_version, 3);
    }

    #[test]
    fn ranges_are_sane() {
        for range in canned_response().api_keys {
            assert!(range.min_version <= range.max_version);
            assert!(range.min_version >= 0);
        }
    }

    #[test]
    fn canned_frame_carries_the_request_correlation() {
        let frame = canned_frame(3, 7);
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(frame.header.correlation_id, 7);
        assert_eq!(frame.api_key, ApiKey::ApiVersions as i16);
    }
}
