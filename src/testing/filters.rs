//! Scripted filters for exercising the chain runtime end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kafka_protocol::messages::create_topics_response::CreatableTopicResult;
use kafka_protocol::messages::{
    ApiKey, CreateTopicsRequest, CreateTopicsResponse, FetchRequest, MetadataRequest,
    RequestHeader, RequestKind, ResponseKind,
};
use kafka_protocol::protocol::StrBytes;
use parking_lot::Mutex;

use crate::proxy::error::Result;
use crate::proxy::filter::{Filter, FilterContext, RequestFilterResult};

/// Kafka error code INVALID_TOPIC_EXCEPTION.
pub const INVALID_TOPIC_EXCEPTION: i16 = 17;

/// Message attached to every rejected topic.
pub const REJECTION_MESSAGE: &str = "rejecting all topics";

/// Rejects every CreateTopics request with a short-circuit error response;
/// the broker never sees the request. Optionally closes the connection
/// along with the rejection.
pub struct RejectingCreateTopicsFilter {
    close_connection: bool,
}

impl RejectingCreateTopicsFilter {
    pub fn new() -> Self {
        Self {
            close_connection: false,
        }
    }

    pub fn closing_connection() -> Self {
        Self {
            close_connection: true,
        }
    }
}

impl Default for RejectingCreateTopicsFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filter for RejectingCreateTopicsFilter {
    fn request_apis(&self) -> Vec<ApiKey> {
        vec![ApiKey::CreateTopics]
    }

    async fn on_create_topics_request(
        &mut self,
        _api_version: i16,
        _header: RequestHeader,
        request: CreateTopicsRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        // Exercise the scoped buffer machinery on every rejection; release
        // happens when the hook completes.
        let mut scratch = ctx.allocate_byte_buffer(4000);
        scratch.extend_from_slice(REJECTION_MESSAGE.as_bytes());

        let mut response = CreateTopicsResponse::default();
        for topic in &request.topics {
            response.topics.push(
                CreatableTopicResult::default()
                    .with_name(topic.name.clone())
                    .with_error_code(INVALID_TOPIC_EXCEPTION)
                    .with_error_message(Some(StrBytes::from_static_str(REJECTION_MESSAGE))),
            );
        }

        let response = ResponseKind::CreateTopics(response);
        if self.close_connection {
            Ok(RequestFilterResult::short_circuit_and_close(response))
        } else {
            Ok(RequestFilterResult::short_circuit(response))
        }
    }
}

/// Record of what a [`MetadataOnFetchFilter`] observed.
#[derive(Debug, Default)]
pub struct SubRequestProbe {
    /// Topic counts seen in resolved Metadata sub-request responses.
    pub resolved: Vec<usize>,
    /// Errors from failed sub-requests.
    pub failed: Vec<String>,
}

/// Issues an out-of-band Metadata sub-request from inside every Fetch
/// request hook, then forwards the Fetch unchanged. The Metadata response
/// resolves the filter's future and must never reach the client.
pub struct MetadataOnFetchFilter {
    probe: Arc<Mutex<SubRequestProbe>>,
}

impl MetadataOnFetchFilter {
    pub fn new() -> (Self, Arc<Mutex<SubRequestProbe>>) {
        let probe = Arc::new(Mutex::new(SubRequestProbe::default()));
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

#[async_trait]
impl Filter for MetadataOnFetchFilter {
    fn request_apis(&self) -> Vec<ApiKey> {
        vec![ApiKey::Fetch]
    }

    async fn on_fetch_request(
        &mut self,
        _api_version: i16,
        header: RequestHeader,
        request: FetchRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        let lookup = ctx
            .send_request(
                ApiKey::Metadata,
                9,
                RequestKind::Metadata(MetadataRequest::default()),
            )
            .await;
        match lookup {
            Ok(ResponseKind::Metadata(metadata)) => {
                self.probe.lock().resolved.push(metadata.topics.len());
            }
            Ok(other) => {
                self.probe
                    .lock()
                    .failed
                    .push(format!("unexpected response kind: {other:?}"));
            }
            Err(e) => {
                self.probe.lock().failed.push(e.to_string());
            }
        }
        Ok(RequestFilterResult::forward(
            header,
            RequestKind::Fetch(request),
        ))
    }
}

/// Stalls every subscribed request hook long enough to trip the deadline.
pub struct StallingFilter {
    api: ApiKey,
    delay: Duration,
}

impl StallingFilter {
    pub fn new(api: ApiKey, delay: Duration) -> Self {
        Self { api, delay }
    }
}

#[async_trait]
impl Filter for StallingFilter {
    fn request_apis(&self) -> Vec<ApiKey> {
        vec![self.api]
    }

    async fn on_request(
        &mut self,
        _api_version: i16,
        header: RequestHeader,
        body: RequestKind,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        tokio::time::sleep(self.delay).await;
        Ok(RequestFilterResult::forward(header, body))
    }
}
