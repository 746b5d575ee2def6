//! Filter chain runtime.
//!
//! The chain owns the per-connection filter instances in configuration
//! order. Request hooks run front-to-back, response hooks back-to-front,
//! and a short-circuiting filter sends its synthesized response back through
//! the response hooks of the filters before it, exactly as if the broker had
//! answered from that position in the chain.
//!
//! Every hook invocation runs under the configured deadline; blowing it, or
//! returning an error, fails the connection. Frame k+1 of a connection is
//! not dispatched until frame k's outcome is known, so a filter never sees
//! two hooks for the same direction at once.

use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::{RequestKind, ResponseHeader};
use parking_lot::Mutex;
use tracing::debug;

use crate::proxy::cluster::ConnectionInfo;
use crate::proxy::codec::SubscriptionPredicate;
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::filter::context::{BufferPool, FilterContext, SubRequestSender};
use crate::proxy::filter::{Filter, RequestFilterResult, ResponseFilterResult};
use crate::proxy::frame::{DecodedRequestFrame, DecodedResponseFrame};

/// Outcome of running a request frame through the chain.
#[derive(Debug)]
pub enum RequestChainOutcome {
    /// Forward the (possibly mutated) request to the broker.
    Forward(DecodedRequestFrame),
    /// Do not contact the broker. Write the synthesized response to the
    /// client (unless a later response hook dropped it), then close if asked.
    ShortCircuit {
        frame: Option<DecodedResponseFrame>,
        close: bool,
    },
    /// Discard the request.
    Drop,
}

/// Outcome of running a response frame through the chain.
#[derive(Debug)]
pub enum ResponseChainOutcome {
    Forward(DecodedResponseFrame),
    Drop,
    Close,
}

/// Ordered list of `(name, filter)` pairs plus the plumbing hooks need.
pub struct FilterChain {
    filters: Vec<(String, Box<dyn Filter>)>,
    info: ConnectionInfo,
    sub_requests: Arc<dyn SubRequestSender>,
    pool: Arc<Mutex<BufferPool>>,
    timeout: Duration,
}

impl FilterChain {
    pub fn new(
        filters: Vec<(String, Box<dyn Filter>)>,
        info: ConnectionInfo,
        sub_requests: Arc<dyn SubRequestSender>,
        timeout: Duration,
    ) -> Self {
        Self {
            filters,
            info,
            sub_requests,
            pool: Arc::new(Mutex::new(BufferPool::default())),
            timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// The decode predicate implied by the chain: exactly the api keys some
    /// filter subscribed to.
    pub fn subscriptions(&self) -> SubscriptionPredicate {
        SubscriptionPredicate::from_api_keys(
            self.filters.iter().flat_map(|(_, f)| f.request_apis()),
            self.filters.iter().flat_map(|(_, f)| f.response_apis()),
        )
    }

    /// Run a decoded request through the chain, front to back.
    pub async fn on_request(&mut self, frame: DecodedRequestFrame) -> Result<RequestChainOutcome> {
        let DecodedRequestFrame {
            api_version,
            correlation_id,
            has_response,
            decode_response,
            mut header,
            mut body,
        } = frame;
        let api_key = header.request_api_key;

        for index in 0..self.filters.len() {
            let outcome = {
                let entry = &mut self.filters[index];
                let name = entry.0.as_str();
                let mut ctx = FilterContext::new(
                    name,
                    &self.info,
                    &self.sub_requests,
                    &self.pool,
                    self.timeout,
                );
                let hook =
                    dispatch_request(entry.1.as_mut(), api_version, header, body, &mut ctx);
                tokio::time::timeout(self.timeout, hook).await
            };

            let result = self.unwrap_hook_result(index, outcome)?;
            match result {
                RequestFilterResult::Forward {
                    header: next_header,
                    body: next_body,
                } => {
                    header = next_header;
                    body = next_body;
                }
                RequestFilterResult::ShortCircuit {
                    response,
                    close_connection,
                } => {
                    debug!(
                        filter = %self.filters[index].0,
                        api_key,
                        correlation_id,
                        close_connection,
                        "request short-circuited"
                    );
                    let synthesized = DecodedResponseFrame {
                        api_key,
                        api_version,
                        correlation_id,
                        header: ResponseHeader::default().with_correlation_id(correlation_id),
                        body: response,
                    };
                    // The response unwinds through the filters before this
                    // one, as if the broker had answered here.
                    return match self.run_response_hooks(index, synthesized).await? {
                        ResponseChainOutcome::Forward(frame) => Ok(RequestChainOutcome::ShortCircuit {
                            frame: Some(frame),
                            close: close_connection,
                        }),
                        ResponseChainOutcome::Drop => Ok(RequestChainOutcome::ShortCircuit {
                            frame: None,
                            close: close_connection,
                        }),
                        ResponseChainOutcome::Close => Ok(RequestChainOutcome::ShortCircuit {
                            frame: None,
                            close: true,
                        }),
                    };
                }
                RequestFilterResult::Drop => {
                    debug!(filter = %self.filters[index].0, api_key, correlation_id, "request dropped");
                    return Ok(RequestChainOutcome::Drop);
                }
            }
        }

        Ok(RequestChainOutcome::Forward(DecodedRequestFrame {
            api_version,
            correlation_id,
            has_response,
            decode_response,
            header,
            body,
        }))
    }

    /// Run a decoded response through the chain, back to front.
    pub async fn on_response(
        &mut self,
        frame: DecodedResponseFrame,
    ) -> Result<ResponseChainOutcome> {
        let below = self.filters.len();
        self.run_response_hooks(below, frame).await
    }

    /// Run the response hooks of filters with index < `below`, descending.
    async fn run_response_hooks(
        &mut self,
        below: usize,
        frame: DecodedResponseFrame,
    ) -> Result<ResponseChainOutcome> {
        let DecodedResponseFrame {
            api_key,
            api_version,
            correlation_id,
            mut header,
            mut body,
        } = frame;

        for index in (0..below).rev() {
            let outcome = {
                let entry = &mut self.filters[index];
                let name = entry.0.as_str();
                let mut ctx = FilterContext::new(
                    name,
                    &self.info,
                    &self.sub_requests,
                    &self.pool,
                    self.timeout,
                );
                let hook =
                    dispatch_response(entry.1.as_mut(), api_version, header, body, &mut ctx);
                tokio::time::timeout(self.timeout, hook).await
            };

            let result = self.unwrap_hook_result(index, outcome)?;
            match result {
                ResponseFilterResult::Forward {
                    header: next_header,
                    body: next_body,
                } => {
                    header = next_header;
                    body = next_body;
                }
                ResponseFilterResult::Drop => {
                    debug!(filter = %self.filters[index].0, api_key, correlation_id, "response dropped");
                    return Ok(ResponseChainOutcome::Drop);
                }
                ResponseFilterResult::Close => {
                    debug!(filter = %self.filters[index].0, api_key, correlation_id, "response closed connection");
                    return Ok(ResponseChainOutcome::Close);
                }
            }
        }

        Ok(ResponseChainOutcome::Forward(DecodedResponseFrame {
            api_key,
            api_version,
            correlation_id,
            header,
            body,
        }))
    }

    /// Map a hook's timeout/error outcome into the chain's error taxonomy.
    fn unwrap_hook_result<T>(
        &self,
        index: usize,
        outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    ) -> Result<T> {
        match outcome {
            Err(_) => Err(ProxyError::FilterTimeout {
                filter: self.filters[index].0.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => match e {
                passthrough @ (ProxyError::FilterTimeout { .. } | ProxyError::FilterError { .. }) => {
                    Err(passthrough)
                }
                other => Err(ProxyError::filter_error(
                    self.filters[index].0.clone(),
                    other.to_string(),
                )),
            },
            Ok(Ok(result)) => Ok(result),
        }
    }
}

async fn dispatch_request(
    filter: &mut dyn Filter,
    api_version: i16,
    header: kafka_protocol::messages::RequestHeader,
    body: RequestKind,
    ctx: &mut FilterContext<'_>,
) -> Result<RequestFilterResult> {
    match body {
        RequestKind::ApiVersions(b) => {
            filter
                .on_api_versions_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::Metadata(b) => filter.on_metadata_request(api_version, header, b, ctx).await,
        RequestKind::Produce(b) => filter.on_produce_request(api_version, header, b, ctx).await,
        RequestKind::Fetch(b) => filter.on_fetch_request(api_version, header, b, ctx).await,
        RequestKind::ListOffsets(b) => {
            filter
                .on_list_offsets_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::CreateTopics(b) => {
            filter
                .on_create_topics_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::DeleteTopics(b) => {
            filter
                .on_delete_topics_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::OffsetCommit(b) => {
            filter
                .on_offset_commit_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::OffsetFetch(b) => {
            filter
                .on_offset_fetch_request(api_version, header, b, ctx)
                .await
        }
        RequestKind::FindCoordinator(b) => {
            filter
                .on_find_coordinator_request(api_version, header, b, ctx)
                .await
        }
        other => filter.on_request(api_version, header, other, ctx).await,
    }
}

async fn dispatch_response(
    filter: &mut dyn Filter,
    api_version: i16,
    header: ResponseHeader,
    body: kafka_protocol::messages::ResponseKind,
    ctx: &mut FilterContext<'_>,
) -> Result<ResponseFilterResult> {
    use kafka_protocol::messages::ResponseKind;
    match body {
        ResponseKind::ApiVersions(b) => {
            filter
                .on_api_versions_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::Metadata(b) => {
            filter
                .on_metadata_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::Produce(b) => filter.on_produce_response(api_version, header, b, ctx).await,
        ResponseKind::Fetch(b) => filter.on_fetch_response(api_version, header, b, ctx).await,
        ResponseKind::ListOffsets(b) => {
            filter
                .on_list_offsets_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::CreateTopics(b) => {
            filter
                .on_create_topics_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::DeleteTopics(b) => {
            filter
                .on_delete_topics_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::OffsetCommit(b) => {
            filter
                .on_offset_commit_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::OffsetFetch(b) => {
            filter
                .on_offset_fetch_response(api_version, header, b, ctx)
                .await
        }
        ResponseKind::FindCoordinator(b) => {
            filter
                .on_find_coordinator_response(api_version, header, b, ctx)
                .await
        }
        other => filter.on_response(api_version, header, other, ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::codec::ResponsePromise;
    use async_trait::async_trait;
    use kafka_protocol::messages::{ApiKey, FetchRequest, FetchResponse, RequestHeader};
    use kafka_protocol::protocol::StrBytes;
    use std::sync::Arc;

    struct NoUpstream;

    #[async_trait]
    impl SubRequestSender for NoUpstream {
        async fn send_internal(
            &self,
            _frame: DecodedRequestFrame,
            _promise: ResponsePromise,
        ) -> Result<()> {
            Err(ProxyError::upstream_closed("no upstream in this test"))
        }
    }

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records hook invocations; can be scripted to mutate, short-circuit,
    /// drop, stall or fail.
    struct Scripted {
        tag: &'static str,
        journal: Journal,
        request_action: Action,
    }

    enum Action {
        Forward,
        TagClientId,
        ShortCircuit,
        Drop,
        Stall,
        Fail,
    }

    #[async_trait]
    impl Filter for Scripted {
        fn request_apis(&self) -> Vec<ApiKey> {
            vec![ApiKey::Fetch]
        }

        fn response_apis(&self) -> Vec<ApiKey> {
            vec![ApiKey::Fetch]
        }

        async fn on_request(
            &mut self,
            _api_version: i16,
            mut header: RequestHeader,
            body: RequestKind,
            _ctx: &mut FilterContext<'_>,
        ) -> Result<RequestFilterResult> {
            self.journal.lock().push(format!("{}:req", self.tag));
            match self.request_action {
                Action::Forward => Ok(RequestFilterResult::forward(header, body)),
                Action::TagClientId => {
                    header.client_id = Some(StrBytes::from_static_str("tagged"));
                    Ok(RequestFilterResult::forward(header, body))
                }
                Action::ShortCircuit => Ok(RequestFilterResult::short_circuit(
                    kafka_protocol::messages::ResponseKind::Fetch(FetchResponse::default()),
                )),
                Action::Drop => Ok(RequestFilterResult::Drop),
                Action::Stall => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(RequestFilterResult::forward(header, body))
                }
                Action::Fail => Err(ProxyError::malformed("scripted failure")),
            }
        }

        async fn on_response(
            &mut self,
            _api_version: i16,
            header: ResponseHeader,
            body: kafka_protocol::messages::ResponseKind,
            _ctx: &mut FilterContext<'_>,
        ) -> Result<ResponseFilterResult> {
            self.journal.lock().push(format!("{}:resp", self.tag));
            Ok(ResponseFilterResult::forward(header, body))
        }
    }

    fn chain_of(actions: Vec<(&'static str, Action)>, journal: &Journal) -> FilterChain {
        let filters = actions
            .into_iter()
            .map(|(tag, action)| {
                (
                    tag.to_string(),
                    Box::new(Scripted {
                        tag,
                        journal: Arc::clone(journal),
                        request_action: action,
                    }) as Box<dyn Filter>,
                )
            })
            .collect();
        FilterChain::new(
            filters,
            ConnectionInfo::default(),
            Arc::new(NoUpstream),
            Duration::from_millis(100),
        )
    }

    fn fetch_request(correlation_id: i32) -> DecodedRequestFrame {
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::Fetch as i16;
        header.request_api_version = 12;
        header.correlation_id = correlation_id;
        DecodedRequestFrame {
            api_version: 12,
            correlation_id,
            has_response: true,
            decode_response: true,
            header,
            body: RequestKind::Fetch(FetchRequest::default()),
        }
    }

    fn fetch_response(correlation_id: i32) -> DecodedResponseFrame {
        DecodedResponseFrame {
            api_key: ApiKey::Fetch as i16,
            api_version: 12,
            correlation_id,
            header: ResponseHeader::default().with_correlation_id(correlation_id),
            body: kafka_protocol::messages::ResponseKind::Fetch(FetchResponse::default()),
        }
    }

    #[tokio::test]
    async fn requests_run_front_to_back_responses_back_to_front() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(
            vec![("a", Action::Forward), ("b", Action::Forward)],
            &journal,
        );

        let outcome = chain.on_request(fetch_request(1)).await.unwrap();
        assert!(matches!(outcome, RequestChainOutcome::Forward(_)));

        let outcome = chain.on_response(fetch_response(1)).await.unwrap();
        assert!(matches!(outcome, ResponseChainOutcome::Forward(_)));

        assert_eq!(
            *journal.lock(),
            vec!["a:req", "b:req", "b:resp", "a:resp"]
        );
    }

    #[tokio::test]
    async fn mutations_thread_to_the_next_filter() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(
            vec![("a", Action::TagClientId), ("b", Action::Forward)],
            &journal,
        );

        let outcome = chain.on_request(fetch_request(5)).await.unwrap();
        let RequestChainOutcome::Forward(frame) = outcome else {
            panic!("expected forward");
        };
        assert_eq!(frame.header.client_id.as_deref(), Some("tagged"));
    }

    #[tokio::test]
    async fn short_circuit_unwinds_through_earlier_filters_only() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(
            vec![
                ("a", Action::Forward),
                ("b", Action::ShortCircuit),
                ("c", Action::Forward),
            ],
            &journal,
        );

        let outcome = chain.on_request(fetch_request(9)).await.unwrap();
        let RequestChainOutcome::ShortCircuit { frame, close } = outcome else {
            panic!("expected short-circuit");
        };
        assert!(!close);
        let frame = frame.expect("response survived the unwind");
        assert_eq!(frame.correlation_id, 9);

        // Filter c never ran; only a's response hook saw the synthesized
        // response on the way back.
        assert_eq!(*journal.lock(), vec!["a:req", "b:req", "a:resp"]);
    }

    #[tokio::test]
    async fn drop_discards_the_request() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(vec![("a", Action::Drop), ("b", Action::Forward)], &journal);

        let outcome = chain.on_request(fetch_request(2)).await.unwrap();
        assert!(matches!(outcome, RequestChainOutcome::Drop));
        assert_eq!(*journal.lock(), vec!["a:req"]);
    }

    #[tokio::test]
    async fn stalled_hook_times_out() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(vec![("slow", Action::Stall)], &journal);

        let err = chain.on_request(fetch_request(3)).await.unwrap_err();
        let ProxyError::FilterTimeout { filter, timeout_ms } = err else {
            panic!("expected timeout, got {err}");
        };
        assert_eq!(filter, "slow");
        assert_eq!(timeout_ms, 100);
    }

    #[tokio::test]
    async fn hook_errors_carry_the_filter_name() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain_of(vec![("broken", Action::Fail)], &journal);

        let err = chain.on_request(fetch_request(4)).await.unwrap_err();
        let ProxyError::FilterError { filter, message } = err else {
            panic!("expected filter error, got {err}");
        };
        assert_eq!(filter, "broken");
        assert!(message.contains("scripted failure"));
    }

    #[tokio::test]
    async fn subscriptions_union_all_filters() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(
            vec![("a", Action::Forward), ("b", Action::Forward)],
            &journal,
        );
        let predicate = chain.subscriptions();
        assert!(predicate.should_decode_request(ApiKey::Fetch as i16));
        assert!(predicate.should_decode_response(ApiKey::Fetch as i16));
        assert!(!predicate.should_decode_request(ApiKey::Produce as i16));
    }
}
