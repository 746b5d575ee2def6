//! Response codecs: the broker-facing decoder and the client-facing encoder.
//!
//! Response headers carry nothing but a correlation id, so the decoder is
//! correlation-driven: the entry recorded at request-encode time supplies
//! the api key, version and decode decision. The entry is consumed on the
//! spot; its downstream correlation id is restored into the frame before
//! anything else sees it, and a sub-request promise (when present) rides
//! along so the backend can fulfill it instead of forwarding.

use bytes::{BufMut, BytesMut};
use kafka_protocol::messages::{ApiKey, ResponseHeader, ResponseKind};
use kafka_protocol::protocol::{Decodable, Encodable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::proxy::codec::correlation::ResponsePromise;
use crate::proxy::codec::{response_header_version, split_frame, SharedCorrelation};
use crate::proxy::constants::{MIN_RESPONSE_FRAME, RESPONSE_CORRELATION_OFFSET};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::frame::{DecodedResponseFrame, OpaqueResponseFrame, ResponseFrame};

/// One broker response paired with the promise it may have to fulfill.
#[derive(Debug)]
pub struct BrokerMessage {
    pub frame: ResponseFrame,
    /// Present when the response answers a filter's out-of-band sub-request.
    /// The frame then resolves the promise and is never written downstream.
    pub promise: Option<ResponsePromise>,
}

/// Broker → proxy response decoder.
pub struct ResponseDecoder {
    correlation: SharedCorrelation,
    max_frame_size: i32,
}

impl ResponseDecoder {
    pub fn new(correlation: SharedCorrelation, max_frame_size: i32) -> Self {
        Self {
            correlation,
            max_frame_size,
        }
    }

    fn decode_frame(&self, mut payload: BytesMut) -> Result<BrokerMessage> {
        if payload.len() < MIN_RESPONSE_FRAME {
            return Err(ProxyError::malformed(format!(
                "response frame of {} bytes cannot hold a correlation id",
                payload.len()
            )));
        }
        let upstream_id = i32::from_be_bytes([
            payload[RESPONSE_CORRELATION_OFFSET],
            payload[RESPONSE_CORRELATION_OFFSET + 1],
            payload[RESPONSE_CORRELATION_OFFSET + 2],
            payload[RESPONSE_CORRELATION_OFFSET + 3],
        ]);

        let entry = self.correlation.lock().consume(upstream_id)?;
        let downstream_id = entry.downstream_correlation_id;
        trace!(
            upstream = upstream_id,
            downstream = downstream_id,
            api_key = entry.api_key,
            internal = entry.promise.is_some(),
            "response frame"
        );

        let frame = if entry.decode_response {
            let key = ApiKey::try_from(entry.api_key).map_err(|_| {
                ProxyError::malformed(format!("unknown api key {} in flight", entry.api_key))
            })?;
            let header_version = response_header_version(key, entry.api_version);
            let mut buf = payload.freeze();
            let mut header = ResponseHeader::decode(&mut buf, header_version).map_err(|e| {
                ProxyError::malformed(format!(
                    "response header (api_key={} v{}): {e}",
                    entry.api_key, entry.api_version
                ))
            })?;
            header.correlation_id = downstream_id;
            let body = ResponseKind::decode(key, &mut buf, entry.api_version).map_err(|e| {
                ProxyError::malformed(format!(
                    "response body (api_key={} v{}): {e}",
                    entry.api_key, entry.api_version
                ))
            })?;
            ResponseFrame::Decoded(DecodedResponseFrame {
                api_key: entry.api_key,
                api_version: entry.api_version,
                correlation_id: downstream_id,
                header,
                body,
            })
        } else {
            // Restore the client's correlation id in place and pass the rest
            // through untouched.
            payload[RESPONSE_CORRELATION_OFFSET..RESPONSE_CORRELATION_OFFSET + 4]
                .copy_from_slice(&downstream_id.to_be_bytes());
            ResponseFrame::Opaque(OpaqueResponseFrame {
                api_key: entry.api_key,
                api_version: entry.api_version,
                correlation_id: downstream_id,
                payload: payload.freeze(),
            })
        };

        Ok(BrokerMessage {
            frame,
            promise: entry.promise,
        })
    }
}

impl Decoder for ResponseDecoder {
    type Item = BrokerMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BrokerMessage>> {
        match split_frame(src, self.max_frame_size)? {
            None => Ok(None),
            Some(payload) => Ok(Some(self.decode_frame(payload)?)),
        }
    }
}

/// Proxy → client response encoder.
#[derive(Debug, Default)]
pub struct ResponseEncoder;

impl Encoder<ResponseFrame> for ResponseEncoder {
    type Error = ProxyError;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            ResponseFrame::Opaque(frame) => {
                dst.reserve(4 + frame.payload.len());
                dst.put_i32(frame.payload.len() as i32);
                dst.extend_from_slice(&frame.payload);
                Ok(())
            }
            ResponseFrame::Decoded(frame) => {
                let key = ApiKey::try_from(frame.api_key).map_err(|_| {
                    ProxyError::encode(format!("unknown api key {}", frame.api_key))
                })?;
                let header_version = response_header_version(key, frame.api_version);

                let len_at = dst.len();
                dst.put_i32(0);
                frame
                    .header
                    .encode(dst, header_version)
                    .map_err(|e| ProxyError::encode(format!("response header: {e}")))?;
                frame
                    .body
                    .encode(dst, frame.api_version)
                    .map_err(|e| ProxyError::encode(format!("response body: {e}")))?;
                let frame_len = (dst.len() - len_at - 4) as i32;
                dst[len_at..len_at + 4].copy_from_slice(&frame_len.to_be_bytes());
                Ok(())
            }
        }
    }
}
