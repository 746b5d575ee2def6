//! Filter SPI.
//!
//! A filter intercepts decoded frames on their way through the proxy. It
//! declares which api keys it wants (`request_apis` / `response_apis`, which
//! feed the decode predicate) and overrides either the typed per-api hooks
//! or the `on_request` / `on_response` catch-alls. Every hook returns a
//! result value that tells the runtime what to do next: forward the
//! (possibly mutated) frame, answer the client directly without involving
//! the broker, or drop the frame.
//!
//! Request hooks run front-to-back in chain order, response hooks
//! back-to-front. Hooks are async and run one at a time per connection;
//! the runtime enforces a per-hook deadline.

pub mod chain;
pub mod context;

use async_trait::async_trait;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, ApiVersionsResponse, CreateTopicsRequest, CreateTopicsResponse,
    DeleteTopicsRequest, DeleteTopicsResponse, FetchRequest, FetchResponse,
    FindCoordinatorRequest, FindCoordinatorResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, OffsetCommitRequest, OffsetCommitResponse,
    OffsetFetchRequest, OffsetFetchResponse, ProduceRequest, ProduceResponse, RequestHeader,
    RequestKind, ResponseHeader, ResponseKind,
};

use crate::proxy::error::Result;

pub use chain::{FilterChain, RequestChainOutcome, ResponseChainOutcome};
pub use context::{FilterContext, PooledBuffer, SubRequestSender};

/// What a request hook decided.
#[derive(Debug)]
pub enum RequestFilterResult {
    /// Hand the frame to the next filter and eventually the broker.
    Forward {
        header: RequestHeader,
        body: RequestKind,
    },
    /// Do not contact the broker; send this response back toward the client
    /// through the response hooks of the filters before this one.
    ShortCircuit {
        response: ResponseKind,
        close_connection: bool,
    },
    /// Discard the request silently. Only meaningful for requests without a
    /// response.
    Drop,
}

impl RequestFilterResult {
    pub fn forward(header: RequestHeader, body: RequestKind) -> Self {
        RequestFilterResult::Forward { header, body }
    }

    pub fn short_circuit(response: ResponseKind) -> Self {
        RequestFilterResult::ShortCircuit {
            response,
            close_connection: false,
        }
    }

    pub fn short_circuit_and_close(response: ResponseKind) -> Self {
        RequestFilterResult::ShortCircuit {
            response,
            close_connection: true,
        }
    }
}

/// What a response hook decided.
#[derive(Debug)]
pub enum ResponseFilterResult {
    Forward {
        header: ResponseHeader,
        body: ResponseKind,
    },
    /// Discard the response silently.
    Drop,
    /// Discard the response and close the connection.
    Close,
}

impl ResponseFilterResult {
    pub fn forward(header: ResponseHeader, body: ResponseKind) -> Self {
        ResponseFilterResult::Forward { header, body }
    }
}

/// A user-supplied interceptor.
///
/// Override the typed hooks for the apis you care about, or the catch-alls
/// for anything else, and declare your subscriptions so the codec decodes
/// those frames in the first place. Unsubscribed apis never reach a filter;
/// they pass through the proxy as raw bytes.
#[async_trait]
pub trait Filter: Send {
    /// Api keys whose *requests* this filter intercepts.
    fn request_apis(&self) -> Vec<ApiKey> {
        Vec::new()
    }

    /// Api keys whose *responses* this filter intercepts.
    fn response_apis(&self) -> Vec<ApiKey> {
        Vec::new()
    }

    /// Catch-all request hook; the typed hooks funnel here by default.
    async fn on_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: RequestKind,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        let _ = (api_version, ctx);
        Ok(RequestFilterResult::Forward { header, body })
    }

    /// Catch-all response hook; the typed hooks funnel here by default.
    async fn on_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: ResponseKind,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        let _ = (api_version, ctx);
        Ok(ResponseFilterResult::Forward { header, body })
    }

    async fn on_api_versions_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: ApiVersionsRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::ApiVersions(body), ctx)
            .await
    }

    async fn on_metadata_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: MetadataRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::Metadata(body), ctx)
            .await
    }

    async fn on_produce_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: ProduceRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::Produce(body), ctx)
            .await
    }

    async fn on_fetch_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: FetchRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::Fetch(body), ctx)
            .await
    }

    async fn on_list_offsets_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: ListOffsetsRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::ListOffsets(body), ctx)
            .await
    }

    async fn on_create_topics_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: CreateTopicsRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::CreateTopics(body), ctx)
            .await
    }

    async fn on_delete_topics_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: DeleteTopicsRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::DeleteTopics(body), ctx)
            .await
    }

    async fn on_offset_commit_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: OffsetCommitRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::OffsetCommit(body), ctx)
            .await
    }

    async fn on_offset_fetch_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: OffsetFetchRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::OffsetFetch(body), ctx)
            .await
    }

    async fn on_find_coordinator_request(
        &mut self,
        api_version: i16,
        header: RequestHeader,
        body: FindCoordinatorRequest,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult> {
        self.on_request(api_version, header, RequestKind::FindCoordinator(body), ctx)
            .await
    }

    async fn on_api_versions_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: ApiVersionsResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::ApiVersions(body), ctx)
            .await
    }

    async fn on_metadata_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: MetadataResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::Metadata(body), ctx)
            .await
    }

    async fn on_produce_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: ProduceResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::Produce(body), ctx)
            .await
    }

    async fn on_fetch_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: FetchResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::Fetch(body), ctx)
            .await
    }

    async fn on_list_offsets_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: ListOffsetsResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::ListOffsets(body), ctx)
            .await
    }

    async fn on_create_topics_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: CreateTopicsResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::CreateTopics(body), ctx)
            .await
    }

    async fn on_delete_topics_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: DeleteTopicsResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::DeleteTopics(body), ctx)
            .await
    }

    async fn on_offset_commit_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: OffsetCommitResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::OffsetCommit(body), ctx)
            .await
    }

    async fn on_offset_fetch_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: OffsetFetchResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::OffsetFetch(body), ctx)
            .await
    }

    async fn on_find_coordinator_response(
        &mut self,
        api_version: i16,
        header: ResponseHeader,
        body: FindCoordinatorResponse,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult> {
        self.on_response(api_version, header, ResponseKind::FindCoordinator(body), ctx)
            .await
    }
}
