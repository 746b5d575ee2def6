//! Request codecs: the client-facing decoder and the broker-facing encoder.
//!
//! The decoder is frame-aligned and lazy. It peeks the fixed header prefix
//! of every frame, asks the decode predicate whether the frame deserves full
//! decoding, and otherwise passes the raw bytes through untouched. The only
//! piece of body it ever reads on the opaque path is the Produce acks field,
//! which decides whether the broker will answer at all.
//!
//! The encoder owns the correlation rewrite: every request leaves toward the
//! broker under a proxy-assigned correlation id, allocated from the
//! connection's correlation table.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind};
use kafka_protocol::protocol::{Decodable, Encodable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::proxy::codec::correlation::{RequestMeta, ResponsePromise};
use crate::proxy::codec::predicate::SaslDecodePredicate;
use crate::proxy::codec::{split_frame, SharedCorrelation};
use crate::proxy::constants::{MIN_REQUEST_FRAME, REQUEST_CORRELATION_OFFSET};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::frame::{DecodedRequestFrame, OpaqueRequestFrame, RequestFrame};
use crate::proxy::haproxy::{self, PreambleParse, ProxyPreamble};

/// What the client-facing decoder yields.
#[derive(Debug)]
pub enum ClientMessage {
    /// The optional PROXY-protocol preamble, legal only as the first message.
    HaProxy(ProxyPreamble),
    Request(RequestFrame),
}

/// Client → proxy request decoder.
pub struct RequestDecoder {
    predicate: SaslDecodePredicate,
    max_frame_size: i32,
    /// Open until the first bytes have been classified; a PROXY preamble is
    /// only ever legal at the very start of the stream.
    preamble_window: bool,
}

impl RequestDecoder {
    pub fn new(predicate: SaslDecodePredicate, max_frame_size: i32) -> Self {
        Self {
            predicate,
            max_frame_size,
            preamble_window: true,
        }
    }

    pub fn predicate(&self) -> &SaslDecodePredicate {
        &self.predicate
    }

    pub fn predicate_mut(&mut self) -> &mut SaslDecodePredicate {
        &mut self.predicate
    }

    fn decode_frame(&self, payload: BytesMut) -> Result<RequestFrame> {
        if payload.len() < MIN_REQUEST_FRAME {
            return Err(ProxyError::malformed(format!(
                "request frame of {} bytes cannot hold a header",
                payload.len()
            )));
        }
        let payload = payload.freeze();
        let api_key = i16::from_be_bytes([payload[0], payload[1]]);
        let api_version = i16::from_be_bytes([payload[2], payload[3]]);
        let correlation_id = i32::from_be_bytes([
            payload[REQUEST_CORRELATION_OFFSET],
            payload[REQUEST_CORRELATION_OFFSET + 1],
            payload[REQUEST_CORRELATION_OFFSET + 2],
            payload[REQUEST_CORRELATION_OFFSET + 3],
        ]);

        let decode_body = self.predicate.should_decode_request(api_key, api_version);
        let decode_response = self.predicate.should_decode_response(api_key, api_version);
        trace!(api_key, api_version, correlation_id, decode_body, "request frame");

        let key = ApiKey::try_from(api_key).ok();
        match key {
            Some(key) if decode_body => {
                let mut buf = payload.clone();
                let header_version = key.request_header_version(api_version);
                let header = RequestHeader::decode(&mut buf, header_version).map_err(|e| {
                    ProxyError::malformed(format!(
                        "request header (api_key={api_key} v{api_version}): {e}"
                    ))
                })?;
                let has_response = if key == ApiKey::Produce {
                    produce_has_response(buf.clone(), api_version, header_version)?
                } else {
                    true
                };
                let body = RequestKind::decode(key, &mut buf, api_version).map_err(|e| {
                    ProxyError::malformed(format!(
                        "request body (api_key={api_key} v{api_version}): {e}"
                    ))
                })?;
                Ok(RequestFrame::Decoded(DecodedRequestFrame {
                    api_version,
                    correlation_id,
                    has_response,
                    decode_response,
                    header,
                    body,
                }))
            }
            _ => {
                let has_response = match key {
                    Some(ApiKey::Produce) => {
                        // Even opaque Produce frames need the acks sniff:
                        // acks=0 requests never get a response and must not
                        // occupy correlation table space.
                        let mut buf = payload.clone();
                        let header_version = ApiKey::Produce.request_header_version(api_version);
                        RequestHeader::decode(&mut buf, header_version).map_err(|e| {
                            ProxyError::malformed(format!("produce request header: {e}"))
                        })?;
                        produce_has_response(buf, api_version, header_version)?
                    }
                    _ => true,
                };
                Ok(RequestFrame::Opaque(OpaqueRequestFrame {
                    api_key,
                    api_version,
                    correlation_id,
                    has_response,
                    decode_response,
                    payload,
                }))
            }
        }
    }
}

impl Decoder for RequestDecoder {
    type Item = ClientMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientMessage>> {
        if self.preamble_window {
            match haproxy::try_parse(src)? {
                PreambleParse::Preamble(preamble) => {
                    self.preamble_window = false;
                    return Ok(Some(ClientMessage::HaProxy(preamble)));
                }
                PreambleParse::NotPreamble => {
                    self.preamble_window = false;
                }
                PreambleParse::Incomplete => return Ok(None),
            }
        }

        match split_frame(src, self.max_frame_size)? {
            None => Ok(None),
            Some(payload) => Ok(Some(ClientMessage::Request(self.decode_frame(payload)?))),
        }
    }
}

/// Determine whether a Produce request expects a response without decoding
/// the full body: skip the nullable `transactional_id` (v3+), then read the
/// 2-byte acks field. `buf` must be positioned at the start of the body.
fn produce_has_response(mut buf: Bytes, api_version: i16, header_version: i16) -> Result<bool> {
    if api_version >= 3 {
        // Flexible message versions (header v2) use a compact nullable
        // string; earlier versions a length-prefixed nullable string.
        if header_version >= 2 {
            let len = get_unsigned_varint(&mut buf)?;
            let skip = len.saturating_sub(1) as usize;
            if buf.remaining() < skip {
                return Err(ProxyError::malformed("produce transactional_id truncated"));
            }
            buf.advance(skip);
        } else {
            if buf.remaining() < 2 {
                return Err(ProxyError::malformed("produce transactional_id truncated"));
            }
            let len = buf.get_i16();
            if len > 0 {
                if buf.remaining() < len as usize {
                    return Err(ProxyError::malformed("produce transactional_id truncated"));
                }
                buf.advance(len as usize);
            }
        }
    }
    if buf.remaining() < 2 {
        return Err(ProxyError::malformed("produce request missing acks"));
    }
    Ok(buf.get_i16() != 0)
}

fn get_unsigned_varint(buf: &mut Bytes) -> Result<u32> {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(ProxyError::malformed("truncated varint"));
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 32 {
            return Err(ProxyError::malformed("varint exceeds 32 bits"));
        }
    }
}

/// What the broker-facing encoder accepts.
#[derive(Debug)]
pub enum UpstreamRequest {
    /// A client request on its normal way upstream.
    Forward(RequestFrame),
    /// An out-of-band sub-request issued by a filter. The response resolves
    /// the promise and is never forwarded to the client.
    Internal {
        frame: DecodedRequestFrame,
        promise: ResponsePromise,
    },
}

/// Proxy → broker request encoder.
pub struct RequestEncoder {
    correlation: SharedCorrelation,
}

impl RequestEncoder {
    pub fn new(correlation: SharedCorrelation) -> Self {
        Self { correlation }
    }

    fn encode_opaque(&self, frame: &OpaqueRequestFrame, upstream_id: i32, dst: &mut BytesMut) {
        dst.reserve(4 + frame.payload.len());
        dst.put_i32(frame.payload.len() as i32);
        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        // Correlation id sits at a fixed offset behind the api key and
        // version; rewrite it in place.
        let at = start + REQUEST_CORRELATION_OFFSET;
        dst[at..at + 4].copy_from_slice(&upstream_id.to_be_bytes());
    }

    fn encode_decoded(
        &self,
        frame: &DecodedRequestFrame,
        upstream_id: i32,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let key = ApiKey::try_from(frame.api_key())
            .map_err(|_| ProxyError::encode(format!("unknown api key {}", frame.api_key())))?;
        let header_version = key.request_header_version(frame.api_version);

        let mut header = frame.header.clone();
        header.correlation_id = upstream_id;

        let len_at = dst.len();
        dst.put_i32(0);
        header
            .encode(dst, header_version)
            .map_err(|e| ProxyError::encode(format!("request header: {e}")))?;
        frame
            .body
            .encode(dst, frame.api_version)
            .map_err(|e| ProxyError::encode(format!("request body: {e}")))?;
        let frame_len = (dst.len() - len_at - 4) as i32;
        dst[len_at..len_at + 4].copy_from_slice(&frame_len.to_be_bytes());
        Ok(())
    }
}

impl Encoder<UpstreamRequest> for RequestEncoder {
    type Error = ProxyError;

    fn encode(&mut self, item: UpstreamRequest, dst: &mut BytesMut) -> Result<()> {
        match item {
            UpstreamRequest::Forward(frame) => {
                let meta = RequestMeta {
                    downstream_correlation_id: frame.correlation_id(),
                    api_key: frame.api_key(),
                    api_version: frame.api_version(),
                    has_response: frame.has_response(),
                    decode_response: match &frame {
                        RequestFrame::Opaque(f) => f.decode_response,
                        RequestFrame::Decoded(f) => f.decode_response,
                    },
                };
                let upstream_id = self.correlation.lock().assign(meta, None);
                trace!(
                    downstream = meta.downstream_correlation_id,
                    upstream = upstream_id,
                    api_key = meta.api_key,
                    "forwarding request"
                );
                match &frame {
                    RequestFrame::Opaque(f) => {
                        self.encode_opaque(f, upstream_id, dst);
                        Ok(())
                    }
                    RequestFrame::Decoded(f) => self.encode_decoded(f, upstream_id, dst),
                }
            }
            UpstreamRequest::Internal { frame, promise } => {
                let meta = RequestMeta {
                    downstream_correlation_id: frame.correlation_id,
                    api_key: frame.api_key(),
                    api_version: frame.api_version,
                    has_response: frame.has_response,
                    decode_response: true,
                };
                let upstream_id = self.correlation.lock().assign(meta, Some(promise));
                trace!(
                    upstream = upstream_id,
                    api_key = meta.api_key,
                    "sending filter sub-request"
                );
                self.encode_decoded(&frame, upstream_id, dst)
            }
        }
    }
}
