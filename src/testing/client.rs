//! A minimal Kafka wire client for driving the proxy in tests.
//!
//! Just enough to write one request frame and read one response frame over
//! a plain TCP stream, with the header versions computed the same way a
//! real client would.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proxy::codec::response_header_version;
use crate::proxy::error::{ProxyError, Result};

/// Encode and send one request frame.
pub async fn send_request<B: Encodable>(
    stream: &mut TcpStream,
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: &B,
) -> Result<()> {
    let header_version = api_key.request_header_version(api_version);
    let mut header = RequestHeader::default();
    header.request_api_key = api_key as i16;
    header.request_api_version = api_version;
    header.correlation_id = correlation_id;
    if header_version >= 1 {
        header.client_id = Some(StrBytes::from_static_str("test-client"));
    }

    let mut payload = BytesMut::new();
    header
        .encode(&mut payload, header_version)
        .map_err(|e| ProxyError::encode(format!("test request header: {e}")))?;
    body.encode(&mut payload, api_version)
        .map_err(|e| ProxyError::encode(format!("test request body: {e}")))?;

    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_i32(payload.len() as i32);
    framed.extend_from_slice(&payload);
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one response frame; returns the correlation id and the body bytes
/// that follow the response header.
pub async fn read_response(
    stream: &mut TcpStream,
    api_key: ApiKey,
    api_version: i16,
) -> Result<(i32, Bytes)> {
    let frame_len = stream.read_i32().await?;
    if frame_len <= 0 {
        return Err(ProxyError::malformed(format!(
            "test client read frame length {frame_len}"
        )));
    }
    let mut frame = vec![0u8; frame_len as usize];
    stream.read_exact(&mut frame).await?;

    let mut buf = Bytes::from(frame);
    let header = ResponseHeader::decode(&mut buf, response_header_version(api_key, api_version))
        .map_err(|e| ProxyError::malformed(format!("test response header: {e}")))?;
    Ok((header.correlation_id, buf))
}

/// Read one response frame and decode its body.
pub async fn read_response_body<B: Decodable>(
    stream: &mut TcpStream,
    api_key: ApiKey,
    api_version: i16,
) -> Result<(i32, B)> {
    let (correlation_id, mut body_bytes) = read_response(stream, api_key, api_version).await?;
    let body = B::decode(&mut body_bytes, api_version)
        .map_err(|e| ProxyError::malformed(format!("test response body: {e}")))?;
    if body_bytes.has_remaining() {
        return Err(ProxyError::malformed(format!(
            "{} trailing bytes after response body",
            body_bytes.remaining()
        )));
    }
    Ok((correlation_id, body))
}
