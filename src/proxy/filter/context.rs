//! Per-hook filter context.
//!
//! Each hook invocation gets a fresh [`FilterContext`] wired to the
//! connection it runs on. Through it a filter can issue out-of-band
//! sub-requests to the upstream broker, borrow pooled scratch buffers, and
//! read connection facts (SNI hostname, client software, authenticated id,
//! virtual cluster name).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use kafka_protocol::messages::{
    ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind,
};
use kafka_protocol::protocol::StrBytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::proxy::cluster::ConnectionInfo;
use crate::proxy::codec::ResponsePromise;
use crate::proxy::constants::MAX_POOLED_BUFFER_SIZE;
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::filter::{RequestFilterResult, ResponseFilterResult};
use crate::proxy::frame::DecodedRequestFrame;

/// Client id stamped onto sub-requests the proxy originates itself.
const SUB_REQUEST_CLIENT_ID: &str = "krelay";

/// Buffers retained per pool once a hook completes.
const POOL_RETAIN: usize = 4;

/// Sink for out-of-band sub-requests. Implemented by the broker-facing
/// writer; tests substitute scripted impls.
#[async_trait]
pub trait SubRequestSender: Send + Sync {
    async fn send_internal(
        &self,
        frame: DecodedRequestFrame,
        promise: ResponsePromise,
    ) -> Result<()>;
}

/// Bounded pool of scratch buffers shared by the hooks of one connection.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<BytesMut>,
}

impl BufferPool {
    fn get(&mut self, capacity: usize) -> BytesMut {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                if buf.capacity() < capacity {
                    buf.reserve(capacity - buf.capacity());
                }
                buf
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    fn put(&mut self, buf: BytesMut) {
        // Oversized buffers are not worth keeping around.
        if buf.capacity() <= MAX_POOLED_BUFFER_SIZE && self.free.len() < POOL_RETAIN {
            self.free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.len()
    }
}

/// A scratch buffer on loan from the pool. Returning it is not the hook's
/// job: dropping the handle hands the buffer back, on every outcome
/// (success, error, timeout, short-circuit, cancellation).
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<Mutex<BufferPool>>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.lock().put(buf);
        }
    }
}

/// The context handed to each filter hook invocation.
pub struct FilterContext<'a> {
    filter_name: &'a str,
    info: &'a ConnectionInfo,
    sub_requests: &'a Arc<dyn SubRequestSender>,
    pool: &'a Arc<Mutex<BufferPool>>,
    timeout: Duration,
}

impl<'a> FilterContext<'a> {
    pub(crate) fn new(
        filter_name: &'a str,
        info: &'a ConnectionInfo,
        sub_requests: &'a Arc<dyn SubRequestSender>,
        pool: &'a Arc<Mutex<BufferPool>>,
        timeout: Duration,
    ) -> Self {
        Self {
            filter_name,
            info,
            sub_requests,
            pool,
            timeout,
        }
    }

    /// A description of this channel, for logging.
    pub fn channel_descriptor(&self) -> &str {
        &self.info.channel
    }

    /// Name of the virtual cluster this connection belongs to.
    pub fn virtual_cluster_name(&self) -> &str {
        &self.info.virtual_cluster
    }

    /// SNI hostname from the client's TLS hello, if any.
    pub fn sni_hostname(&self) -> Option<&str> {
        self.info.sni_hostname.as_deref()
    }

    /// Client software name reported in the `ApiVersions` request, if any.
    pub fn client_software_name(&self) -> Option<&str> {
        self.info.client_software_name.as_deref()
    }

    /// Client software version reported in the `ApiVersions` request, if any.
    pub fn client_software_version(&self) -> Option<&str> {
        self.info.client_software_version.as_deref()
    }

    /// Authenticated identity of the client, if authentication happened.
    pub fn authorized_id(&self) -> Option<&str> {
        self.info.authorized_id.as_deref()
    }

    /// Borrow a scratch buffer from the connection's pool.
    pub fn allocate_byte_buffer(&self, initial_capacity: usize) -> PooledBuffer {
        PooledBuffer {
            buf: Some(self.pool.lock().get(initial_capacity)),
            pool: Arc::clone(self.pool),
        }
    }

    /// Convenience constructor for the usual request outcome.
    pub fn forward_request(&self, header: RequestHeader, body: RequestKind) -> RequestFilterResult {
        RequestFilterResult::Forward { header, body }
    }

    /// Convenience constructor for the usual response outcome.
    pub fn forward_response(
        &self,
        header: ResponseHeader,
        body: ResponseKind,
    ) -> ResponseFilterResult {
        ResponseFilterResult::Forward { header, body }
    }

    /// Send an out-of-band request to the upstream broker and wait for its
    /// decoded response.
    ///
    /// The proxy allocates a fresh upstream correlation id, so the
    /// sub-request cannot collide with client traffic, and the response is
    /// routed back here instead of to the client. The wait shares the hook
    /// deadline; a connection that dies first fails the future.
    pub async fn send_request(
        &self,
        api_key: ApiKey,
        api_version: i16,
        body: RequestKind,
    ) -> Result<ResponseKind> {
        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = api_version;
        header.correlation_id = 0; // assigned at encode time
        if api_key.request_header_version(api_version) >= 1 {
            header.client_id = Some(StrBytes::from_static_str(SUB_REQUEST_CLIENT_ID));
        }

        let frame = DecodedRequestFrame {
            api_version,
            correlation_id: 0,
            has_response: true,
            decode_response: true,
            header,
            body,
        };

        let (promise, response) = oneshot::channel();
        self.sub_requests.send_internal(frame, promise).await?;

        match tokio::time::timeout(self.timeout, response).await {
            Err(_) => Err(ProxyError::FilterTimeout {
                filter: self.filter_name.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(ProxyError::upstream_closed(
                "connection closed before sub-request response",
            )),
            Ok(Ok(result)) => result.map(|frame| frame.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::frame::DecodedResponseFrame;
    use kafka_protocol::messages::{MetadataRequest, MetadataResponse};

    struct Fake {
        respond: bool,
    }

    #[async_trait]
    impl SubRequestSender for Fake {
        async fn send_internal(
            &self,
            frame: DecodedRequestFrame,
            promise: ResponsePromise,
        ) -> Result<()> {
            if self.respond {
                let _ = promise.send(Ok(DecodedResponseFrame {
                    api_key: frame.api_key(),
                    api_version: frame.api_version,
                    correlation_id: frame.correlation_id,
                    header: ResponseHeader::default(),
                    body: ResponseKind::Metadata(MetadataResponse::default()),
                }));
            } else {
                // Keep the promise pending forever.
                std::mem::forget(promise);
            }
            Ok(())
        }
    }

    fn harness(
        respond: bool,
    ) -> (ConnectionInfo, Arc<dyn SubRequestSender>, Arc<Mutex<BufferPool>>) {
        let info = ConnectionInfo {
            virtual_cluster: "demo".to_string(),
            channel: "client 127.0.0.1:1234".to_string(),
            ..ConnectionInfo::default()
        };
        let sender: Arc<dyn SubRequestSender> = Arc::new(Fake { respond });
        (info, sender, Arc::new(Mutex::new(BufferPool::default())))
    }

    #[tokio::test]
    async fn send_request_resolves_with_decoded_body() {
        let (info, sender, pool) = harness(true);
        let ctx = FilterContext::new("probe", &info, &sender, &pool, Duration::from_secs(1));

        let body = ctx
            .send_request(
                ApiKey::Metadata,
                9,
                RequestKind::Metadata(MetadataRequest::default()),
            )
            .await
            .unwrap();
        assert!(matches!(body, ResponseKind::Metadata(_)));
    }

    #[tokio::test]
    async fn send_request_times_out_when_nothing_answers() {
        let (info, sender, pool) = harness(false);
        let ctx = FilterContext::new("probe", &info, &sender, &pool, Duration::from_millis(20));

        let err = ctx
            .send_request(
                ApiKey::Metadata,
                9,
                RequestKind::Metadata(MetadataRequest::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::FilterTimeout { .. }));
        assert!(format!("{err}").contains("probe"));
    }

    #[tokio::test]
    async fn buffers_return_to_the_pool_on_drop() {
        let (info, sender, pool) = harness(true);
        let ctx = FilterContext::new("probe", &info, &sender, &pool, Duration::from_secs(1));

        {
            let mut buf = ctx.allocate_byte_buffer(4000);
            buf.extend_from_slice(b"scratch");
            assert_eq!(pool.lock().pooled(), 0);
        }
        assert_eq!(pool.lock().pooled(), 1);

        // Reuse comes out cleared.
        let buf = ctx.allocate_byte_buffer(16);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 16);
    }

    #[tokio::test]
    async fn accessors_expose_connection_facts() {
        let (mut info, sender, pool) = harness(true);
        info.sni_hostname = Some("cluster.example.com".to_string());
        info.client_software_name = Some("librdkafka".to_string());
        let ctx = FilterContext::new("probe", &info, &sender, &pool, Duration::from_secs(1));

        assert_eq!(ctx.virtual_cluster_name(), "demo");
        assert_eq!(ctx.sni_hostname(), Some("cluster.example.com"));
        assert_eq!(ctx.client_software_name(), Some("librdkafka"));
        assert_eq!(ctx.authorized_id(), None);
        assert!(ctx.channel_descriptor().contains("127.0.0.1"));
    }
}
