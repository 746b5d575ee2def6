// Wire-level tests across the codec stack: decode on one side, encode on
// the other, and compare against reference encodings produced directly with
// kafka-protocol.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, MetadataRequest, MetadataResponse, ProduceRequest, RequestHeader,
    ResponseHeader,
};
use kafka_protocol::protocol::{Encodable, StrBytes};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use krelay::proxy::codec::{
    response_header_version, ClientMessage, CorrelationManager, RequestDecoder, RequestEncoder,
    ResponseDecoder, ResponseEncoder, SaslDecodePredicate, SharedCorrelation,
    SubscriptionPredicate, UpstreamRequest,
};
use krelay::proxy::constants::DEFAULT_MAX_FRAME_SIZE;
use krelay::proxy::frame::{RequestFrame, ResponseFrame};

fn request_header(api_key: ApiKey, api_version: i16, correlation_id: i32) -> RequestHeader {
    let mut header = RequestHeader::default();
    header.request_api_key = api_key as i16;
    header.request_api_version = api_version;
    header.correlation_id = correlation_id;
    if api_key.request_header_version(api_version) >= 1 {
        header.client_id = Some(StrBytes::from_static_str("codec-test"));
    }
    header
}

fn framed_request<B: Encodable>(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: &B,
) -> BytesMut {
    let mut payload = BytesMut::new();
    request_header(api_key, api_version, correlation_id)
        .encode(&mut payload, api_key.request_header_version(api_version))
        .unwrap();
    body.encode(&mut payload, api_version).unwrap();

    let mut framed = BytesMut::new();
    framed.put_i32(payload.len() as i32);
    framed.extend_from_slice(&payload);
    framed
}

fn framed_response<B: Encodable>(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: &B,
) -> BytesMut {
    let mut payload = BytesMut::new();
    ResponseHeader::default()
        .with_correlation_id(correlation_id)
        .encode(&mut payload, response_header_version(api_key, api_version))
        .unwrap();
    body.encode(&mut payload, api_version).unwrap();

    let mut framed = BytesMut::new();
    framed.put_i32(payload.len() as i32);
    framed.extend_from_slice(&payload);
    framed
}

fn decoder_subscribed_to(api: ApiKey) -> RequestDecoder {
    let mut predicate = SaslDecodePredicate::new(false);
    predicate.install_delegate(SubscriptionPredicate::from_api_keys([api], [api]));
    RequestDecoder::new(predicate, DEFAULT_MAX_FRAME_SIZE)
}

fn decode_request(decoder: &mut RequestDecoder, buf: &mut BytesMut) -> RequestFrame {
    match decoder.decode(buf).unwrap() {
        Some(ClientMessage::Request(frame)) => frame,
        other => panic!("expected request frame, got {other:?}"),
    }
}

/// A decoded ApiVersions request re-encodes to exactly what Kafka's own
/// serialization produces, with only the correlation id rewritten.
#[test]
fn decoded_api_versions_request_round_trips() {
    let mut wire = framed_request(ApiKey::ApiVersions, 3, 52, &ApiVersionsRequest::default());
    let reference = framed_request(ApiKey::ApiVersions, 3, 52, &ApiVersionsRequest::default());

    let mut decoder =
        RequestDecoder::new(SaslDecodePredicate::new(false), DEFAULT_MAX_FRAME_SIZE);
    let frame = decode_request(&mut decoder, &mut wire);
    assert!(matches!(frame, RequestFrame::Decoded(_)));

    // Seed the counter with the downstream id so the rewrite is the
    // identity and byte equality holds.
    let correlation: SharedCorrelation = Arc::new(Mutex::new(CorrelationManager::with_initial_id(52)));
    let mut encoder = RequestEncoder::new(Arc::clone(&correlation));
    let mut out = BytesMut::new();
    encoder
        .encode(UpstreamRequest::Forward(frame), &mut out)
        .unwrap();

    assert_eq!(&out[..], &reference[..]);
    let entry = correlation.lock().consume(52).unwrap();
    assert_eq!(entry.api_key, ApiKey::ApiVersions as i16);
    assert_eq!(entry.api_version, 3);
    assert_eq!(entry.downstream_correlation_id, 52);
    assert!(entry.decode_response);
}

/// Unknown tagged fields on a flexible request header survive the proxy's
/// decode/encode round trip untouched.
#[test]
fn unknown_tagged_fields_round_trip() {
    let mut header = request_header(ApiKey::Metadata, 12, 33);
    header
        .unknown_tagged_fields
        .insert(513, bytes::Bytes::from_static(b"opaque-tag"));

    let mut payload = BytesMut::new();
    header
        .encode(
            &mut payload,
            ApiKey::Metadata.request_header_version(12),
        )
        .unwrap();
    MetadataRequest::default().encode(&mut payload, 12).unwrap();
    let mut wire = BytesMut::new();
    wire.put_i32(payload.len() as i32);
    wire.extend_from_slice(&payload);
    let reference = wire.clone();

    let mut decoder = decoder_subscribed_to(ApiKey::Metadata);
    let frame = decode_request(&mut decoder, &mut wire);
    let RequestFrame::Decoded(decoded) = &frame else {
        panic!("Metadata is subscribed and must decode");
    };
    assert_eq!(
        decoded.header.unknown_tagged_fields.get(&513).map(|b| &b[..]),
        Some(&b"opaque-tag"[..])
    );

    let correlation: SharedCorrelation =
        Arc::new(Mutex::new(CorrelationManager::with_initial_id(33)));
    let mut encoder = RequestEncoder::new(correlation);
    let mut out = BytesMut::new();
    encoder
        .encode(UpstreamRequest::Forward(frame), &mut out)
        .unwrap();
    assert_eq!(&out[..], &reference[..]);
}

/// The full request/response correlation lifecycle: entry appears at
/// request-encode time, the response decoder consumes it and restores the
/// client's correlation id, and the re-encoded response matches the wire
/// format the client expects.
#[test]
fn correlation_lifecycle_end_to_end() {
    let correlation: SharedCorrelation = Arc::new(Mutex::new(CorrelationManager::new()));

    // Client request 45 goes upstream as id 0.
    let mut wire = framed_request(ApiKey::Metadata, 9, 45, &MetadataRequest::default());
    let mut decoder =
        RequestDecoder::new(SaslDecodePredicate::new(false), DEFAULT_MAX_FRAME_SIZE);
    let frame = decode_request(&mut decoder, &mut wire);

    let mut encoder = RequestEncoder::new(Arc::clone(&correlation));
    let mut upstream_bytes = BytesMut::new();
    encoder
        .encode(UpstreamRequest::Forward(frame), &mut upstream_bytes)
        .unwrap();
    assert_eq!(correlation.lock().in_flight(), 1);
    let upstream_id = i32::from_be_bytes([
        upstream_bytes[8],
        upstream_bytes[9],
        upstream_bytes[10],
        upstream_bytes[11],
    ]);
    assert_eq!(upstream_id, 0);

    // Broker answers under the upstream id; the proxy restores 45.
    let mut response_decoder =
        ResponseDecoder::new(Arc::clone(&correlation), DEFAULT_MAX_FRAME_SIZE);
    let mut broker_bytes =
        framed_response(ApiKey::Metadata, 9, upstream_id, &MetadataResponse::default());
    let message = response_decoder.decode(&mut broker_bytes).unwrap().unwrap();
    assert!(correlation.lock().is_empty());
    assert_eq!(message.frame.correlation_id(), 45);

    let mut out = BytesMut::new();
    ResponseEncoder.encode(message.frame, &mut out).unwrap();
    let reference = framed_response(ApiKey::Metadata, 9, 45, &MetadataResponse::default());
    assert_eq!(&out[..], &reference[..]);
}

/// Monotonic upstream ids across a mix of traffic, acks=0 produce included.
#[test]
fn upstream_ids_are_monotonic_across_traffic() {
    let correlation: SharedCorrelation = Arc::new(Mutex::new(CorrelationManager::new()));
    let mut encoder = RequestEncoder::new(Arc::clone(&correlation));
    let mut decoder =
        RequestDecoder::new(SaslDecodePredicate::new(false), DEFAULT_MAX_FRAME_SIZE);

    let mut acks0 = ProduceRequest::default();
    acks0.acks = 0;
    let mut acks1 = ProduceRequest::default();
    acks1.acks = 1;

    let frames = vec![
        framed_request(ApiKey::Metadata, 9, 100, &MetadataRequest::default()),
        framed_request(ApiKey::Produce, 9, 101, &acks0),
        framed_request(ApiKey::Produce, 9, 102, &acks1),
    ];

    let mut upstream_ids = Vec::new();
    for mut wire in frames {
        let frame = decode_request(&mut decoder, &mut wire);
        let mut out = BytesMut::new();
        encoder
            .encode(UpstreamRequest::Forward(frame), &mut out)
            .unwrap();
        upstream_ids.push(i32::from_be_bytes([out[8], out[9], out[10], out[11]]));
    }

    assert_eq!(upstream_ids, vec![0, 1, 2]);
    // Only the metadata request and the acks=1 produce occupy the table.
    assert_eq!(correlation.lock().in_flight(), 2);
}

/// The ApiVersions response header stays v0 on the wire even at body v3:
/// the body must start immediately after the 4 correlation bytes.
#[test]
fn api_versions_response_header_is_v0_on_the_wire() {
    let frame = krelay::proxy::api_versions::canned_frame(3, 7);
    let mut out = BytesMut::new();
    ResponseEncoder
        .encode(ResponseFrame::Decoded(frame), &mut out)
        .unwrap();

    // length(4) + correlation(4) + error_code(2): a v1 header would put a
    // tagged-fields byte before the error code.
    assert_eq!(&out[4..8], &7_i32.to_be_bytes());
    assert_eq!(&out[8..10], &0_i16.to_be_bytes());
}
