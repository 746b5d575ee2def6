//! Framing codecs for both sides of the proxy.
//!
//! Four codecs cover the two directions: the client-facing request decoder
//! and response encoder, and the broker-facing request encoder and response
//! decoder. The broker-facing pair shares a [`CorrelationManager`] so that
//! upstream correlation ids assigned at request-encode time can be resolved
//! back at response-decode time.

pub mod correlation;
pub mod predicate;
pub mod request;
pub mod response;

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use kafka_protocol::messages::ApiKey;
use parking_lot::Mutex;

use crate::proxy::constants::FRAME_LENGTH_PREFIX;
use crate::proxy::error::{ProxyError, Result};

pub use correlation::{CorrelationEntry, CorrelationManager, RequestMeta, ResponsePromise};
pub use predicate::{SaslDecodePredicate, SubscriptionPredicate};
pub use request::{ClientMessage, RequestDecoder, RequestEncoder, UpstreamRequest};
pub use response::{BrokerMessage, ResponseDecoder, ResponseEncoder};

/// The correlation table as shared between the request-encode and
/// response-decode paths of one broker connection.
pub type SharedCorrelation = Arc<Mutex<CorrelationManager>>;

/// Header version for a response at `(api_key, api_version)`.
///
/// `ApiVersions` responses always use a v0 header so clients can parse the
/// response before version negotiation has happened (KIP-511); pinned here
/// rather than trusted to the schema source.
pub fn response_header_version(api_key: ApiKey, api_version: i16) -> i16 {
    if api_key == ApiKey::ApiVersions {
        0
    } else {
        api_key.response_header_version(api_version)
    }
}

/// Split one length-prefixed frame off the front of `src`.
///
/// Returns `None` while the frame is still incomplete; never consumes a
/// partial frame. The returned buffer holds the frame payload without its
/// length prefix.
pub(crate) fn split_frame(src: &mut BytesMut, max_frame_size: i32) -> Result<Option<BytesMut>> {
    if src.len() < FRAME_LENGTH_PREFIX {
        return Ok(None);
    }
    let frame_len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if frame_len <= 0 {
        return Err(ProxyError::malformed(format!(
            "frame length {frame_len} out of range"
        )));
    }
    if frame_len > max_frame_size {
        return Err(ProxyError::malformed(format!(
            "frame length {frame_len} exceeds maximum {max_frame_size}"
        )));
    }
    let total = FRAME_LENGTH_PREFIX + frame_len as usize;
    if src.len() < total {
        // Reserve what the rest of the frame needs so the next read can
        // complete it in one pass.
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(FRAME_LENGTH_PREFIX);
    Ok(Some(src.split_to(frame_len as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn api_versions_response_header_is_always_v0() {
        for version in 0..=3 {
            assert_eq!(response_header_version(ApiKey::ApiVersions, version), 0);
        }
    }

    #[test]
    fn flexible_responses_use_v1_headers() {
        // Metadata v9+ is flexible.
        assert_eq!(response_header_version(ApiKey::Metadata, 12), 1);
        assert_eq!(response_header_version(ApiKey::Metadata, 0), 0);
    }

    #[test]
    fn split_frame_waits_for_length_prefix() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(split_frame(&mut buf, 1024).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn split_frame_waits_for_full_payload() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_u32(0xdead_beef);
        assert!(split_frame(&mut buf, 1024).unwrap().is_none());
        // Nothing consumed.
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn split_frame_extracts_exactly_one_frame() {
        let mut buf = BytesMut::new();
        buf.put_i32(4);
        buf.put_u32(0xdead_beef);
        buf.put_i32(2);

        let frame = split_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&frame[..], &0xdead_beef_u32.to_be_bytes());
        // The next frame's prefix stays put.
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn split_frame_rejects_non_positive_length() {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        assert!(split_frame(&mut buf, 1024).is_err());

        let mut buf = BytesMut::new();
        buf.put_i32(-5);
        assert!(split_frame(&mut buf, 1024).is_err());
    }

    #[test]
    fn split_frame_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_i32(2048);
        let err = split_frame(&mut buf, 1024).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedFrame { .. }));
    }
}
