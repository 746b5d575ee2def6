//! Frame model for messages moving through the proxy.
//!
//! A frame is one length-prefixed Kafka wire message. Frames the filter
//! chain does not care about stay *opaque*: the payload is kept as the raw
//! wire bytes (header included, length prefix excluded) and travels through
//! the proxy untouched except for the correlation id rewrite, which happens
//! at a fixed byte offset. Frames some filter subscribed to are *decoded*
//! into structured header and body values from `kafka-protocol`, which
//! round-trip unknown tagged fields unchanged.

use bytes::Bytes;
use kafka_protocol::messages::{RequestHeader, RequestKind, ResponseHeader, ResponseKind};

/// A request frame decoded into structured header and body.
#[derive(Debug, Clone)]
pub struct DecodedRequestFrame {
    pub api_version: i16,
    pub correlation_id: i32,
    /// Whether the broker will send a response for this request. False only
    /// for acks=0 Produce requests.
    pub has_response: bool,
    /// Whether the matching response should be decoded when it comes back.
    /// Stamped by the request decoder from the decode predicate and recorded
    /// in the correlation entry at encode time.
    pub decode_response: bool,
    pub header: RequestHeader,
    pub body: RequestKind,
}

impl DecodedRequestFrame {
    pub fn api_key(&self) -> i16 {
        self.header.request_api_key
    }
}

/// A request frame kept as raw wire bytes.
#[derive(Debug, Clone)]
pub struct OpaqueRequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub has_response: bool,
    /// Whether the matching response should be decoded when it comes back.
    pub decode_response: bool,
    /// Header and body exactly as read off the wire, without the 4-byte
    /// length prefix.
    pub payload: Bytes,
}

/// A request frame on its way from the client toward the broker.
#[derive(Debug, Clone)]
pub enum RequestFrame {
    Opaque(OpaqueRequestFrame),
    Decoded(DecodedRequestFrame),
}

impl RequestFrame {
    pub fn api_key(&self) -> i16 {
        match self {
            RequestFrame::Opaque(f) => f.api_key,
            RequestFrame::Decoded(f) => f.api_key(),
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            RequestFrame::Opaque(f) => f.api_version,
            RequestFrame::Decoded(f) => f.api_version,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            RequestFrame::Opaque(f) => f.correlation_id,
            RequestFrame::Decoded(f) => f.correlation_id,
        }
    }

    pub fn has_response(&self) -> bool {
        match self {
            RequestFrame::Opaque(f) => f.has_response,
            RequestFrame::Decoded(f) => f.has_response,
        }
    }
}

/// A response frame decoded into structured header and body.
#[derive(Debug, Clone)]
pub struct DecodedResponseFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header: ResponseHeader,
    pub body: ResponseKind,
}

/// A response frame kept as raw wire bytes.
#[derive(Debug, Clone)]
pub struct OpaqueResponseFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    /// Header and body as read off the wire, with the correlation id already
    /// rewritten to the downstream id at offset 0.
    pub payload: Bytes,
}

/// A response frame on its way from the broker toward the client.
#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Opaque(OpaqueResponseFrame),
    Decoded(DecodedResponseFrame),
}

impl ResponseFrame {
    pub fn api_key(&self) -> i16 {
        match self {
            ResponseFrame::Opaque(f) => f.api_key,
            ResponseFrame::Decoded(f) => f.api_key,
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            ResponseFrame::Opaque(f) => f.api_version,
            ResponseFrame::Decoded(f) => f.api_version,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            ResponseFrame::Opaque(f) => f.correlation_id,
            ResponseFrame::Decoded(f) => f.correlation_id,
        }
    }
}
