//! An in-process stand-in for a Kafka broker.
//!
//! Serves one scripted response per api key and records every request it
//! receives so tests can verify what actually crossed the upstream wire.
//! Requests for unscripted api keys are recorded and left unanswered, which
//! doubles as the broker-side behavior for acks=0 produce traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use kafka_protocol::messages::{ApiKey, ResponseHeader, ResponseKind};
use kafka_protocol::protocol::Encodable;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::proxy::codec::response_header_version;
use crate::proxy::error::{ProxyError, Result};

/// One request as the mock broker saw it on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub frame_len: usize,
}

/// What the mock broker should answer per api key.
#[derive(Default)]
pub struct MockScript {
    responses: HashMap<i16, ResponseKind>,
    read_delay: Option<Duration>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve this body (encoded at the request's api version) for every
    /// request with the given api key.
    pub fn respond_with(mut self, api_key: ApiKey, body: ResponseKind) -> Self {
        self.responses.insert(api_key as i16, body);
        self
    }

    /// Sleep before reading each frame, to simulate a slow broker.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }
}

/// The mock broker itself. Dropping it stops the accept loop.
pub struct MockBroker {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    /// Bind an ephemeral port and start serving the script.
    pub async fn start(script: MockScript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(script);

        let recorded = Arc::clone(&requests);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "mock broker accepted connection");
                        let script = Arc::clone(&script);
                        let recorded = Arc::clone(&recorded);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(socket, script, recorded).await {
                                if !e.is_disconnect() {
                                    warn!(%e, "mock broker connection error");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(%e, "mock broker accept error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Everything received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received for one api key.
    pub fn requests_for(&self, api_key: ApiKey) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.api_key == api_key as i16)
            .cloned()
            .collect()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    script: Arc<MockScript>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Result<()> {
    loop {
        if let Some(delay) = script.read_delay {
            tokio::time::sleep(delay).await;
        }

        let frame_len = match socket.read_i32().await {
            Ok(len) => len,
            // Peer went away between frames.
            Err(_) => return Ok(()),
        };
        if frame_len <= 0 {
            return Err(ProxyError::malformed(format!(
                "mock broker read frame length {frame_len}"
            )));
        }
        let mut frame = vec![0u8; frame_len as usize];
        socket.read_exact(&mut frame).await?;
        if frame.len() < 8 {
            return Err(ProxyError::malformed("mock broker read truncated header"));
        }

        let api_key = i16::from_be_bytes([frame[0], frame[1]]);
        let api_version = i16::from_be_bytes([frame[2], frame[3]]);
        let correlation_id = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        recorded.lock().push(RecordedRequest {
            api_key,
            api_version,
            correlation_id,
            frame_len: frame.len(),
        });

        let Some(body) = script.responses.get(&api_key) else {
            debug!(api_key, correlation_id, "mock broker has no script; staying silent");
            continue;
        };

        let key = ApiKey::try_from(api_key)
            .map_err(|_| ProxyError::malformed(format!("mock broker got api key {api_key}")))?;
        let mut payload = BytesMut::new();
        ResponseHeader::default()
            .with_correlation_id(correlation_id)
            .encode(&mut payload, response_header_version(key, api_version))
            .map_err(|e| ProxyError::encode(format!("mock response header: {e}")))?;
        body.encode(&mut payload, api_version)
            .map_err(|e| ProxyError::encode(format!("mock response body: {e}")))?;

        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.put_i32(payload.len() as i32);
        framed.extend_from_slice(&payload);
        socket.write_all(&framed).await?;
        socket.flush().await?;
    }
}
