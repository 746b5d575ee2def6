//! Correlation tracking for a single broker connection.
//!
//! The proxy rewrites every request's correlation id before it goes
//! upstream, so responses coming back carry proxy-assigned ids. This table
//! maps each assigned id to what the response path needs: the client's
//! original correlation id, the api key and version (response headers do not
//! repeat them), whether the response body should be decoded, and, for
//! out-of-band sub-requests issued by filters, the promise to fulfill.
//!
//! Ids are handed out from a monotonic per-connection counter. Because
//! responses drain mostly in allocation order, the table is a sorted deque
//! searched with binary search rather than a hash map.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::proxy::error::{ProxyError, Result};
use crate::proxy::frame::DecodedResponseFrame;

/// Completion side of a filter's out-of-band sub-request.
pub type ResponsePromise = oneshot::Sender<Result<DecodedResponseFrame>>;

/// What the response path needs to know about one in-flight request.
#[derive(Debug)]
pub struct CorrelationEntry {
    pub downstream_correlation_id: i32,
    pub api_key: i16,
    pub api_version: i16,
    pub decode_response: bool,
    /// Present when the request was solicited by a filter rather than the
    /// client; the response resolves the promise and is never forwarded
    /// downstream.
    pub promise: Option<ResponsePromise>,
}

/// Metadata recorded when a request is encoded toward the broker.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta {
    pub downstream_correlation_id: i32,
    pub api_key: i16,
    pub api_version: i16,
    pub has_response: bool,
    pub decode_response: bool,
}

/// Per-broker-connection correlation table.
#[derive(Debug)]
pub struct CorrelationManager {
    next_upstream_id: i32,
    in_flight: VecDeque<(i32, CorrelationEntry)>,
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self::with_initial_id(0)
    }

    /// Start the upstream counter at a specific id. Useful in tests that
    /// want the first assigned id to match the client's.
    pub fn with_initial_id(initial: i32) -> Self {
        Self {
            next_upstream_id: initial,
            in_flight: VecDeque::new(),
        }
    }

    /// Allocate the next upstream correlation id. An entry is inserted only
    /// when the request expects a response; acks=0 Produce requests consume
    /// an id but never occupy table space.
    pub fn assign(&mut self, meta: RequestMeta, promise: Option<ResponsePromise>) -> i32 {
        let upstream_id = self.next_upstream_id;
        self.next_upstream_id = self.next_upstream_id.wrapping_add(1);
        if meta.has_response {
            self.in_flight.push_back((
                upstream_id,
                CorrelationEntry {
                    downstream_correlation_id: meta.downstream_correlation_id,
                    api_key: meta.api_key,
                    api_version: meta.api_version,
                    // Sub-request responses are always decoded: the promise
                    // resolves with a structured body.
                    decode_response: meta.decode_response || promise.is_some(),
                    promise,
                },
            ));
        }
        upstream_id
    }

    /// Look up and remove the entry for a response. Missing entries mean the
    /// broker answered something we never asked, which is terminal.
    pub fn consume(&mut self, upstream_id: i32) -> Result<CorrelationEntry> {
        let index = self
            .in_flight
            .binary_search_by_key(&upstream_id, |(id, _)| *id);
        match index.ok().and_then(|i| self.in_flight.remove(i)) {
            Some((_, entry)) => Ok(entry),
            None => Err(ProxyError::UnknownCorrelation {
                correlation_id: upstream_id,
            }),
        }
    }

    /// Drop every outstanding entry, failing pending sub-request promises
    /// with the given reason. Called when the upstream connection dies.
    pub fn cancel_all(&mut self, reason: &str) {
        for (_, entry) in self.in_flight.drain(..) {
            if let Some(promise) = entry.promise {
                let _ = promise.send(Err(ProxyError::upstream_closed(reason)));
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(downstream: i32, has_response: bool) -> RequestMeta {
        RequestMeta {
            downstream_correlation_id: downstream,
            api_key: 0,
            api_version: 9,
            has_response,
            decode_response: false,
        }
    }

    #[test]
    fn ids_are_strictly_monotonic() {
        let mut manager = CorrelationManager::new();
        let a = manager.assign(meta(1, true), None);
        let b = manager.assign(meta(2, false), None);
        let c = manager.assign(meta(3, true), None);
        assert!(a < b && b < c);
    }

    #[test]
    fn no_entry_for_requests_without_response() {
        let mut manager = CorrelationManager::with_initial_id(78);
        manager.assign(meta(45, false), None);
        assert!(manager.is_empty());
    }

    #[test]
    fn entry_for_requests_with_response() {
        let mut manager = CorrelationManager::with_initial_id(78);
        let id = manager.assign(meta(45, true), None);
        assert_eq!(id, 78);
        assert_eq!(manager.in_flight(), 1);

        let entry = manager.consume(id).expect("entry present");
        assert_eq!(entry.downstream_correlation_id, 45);
        assert!(manager.is_empty());
    }

    #[test]
    fn consume_twice_fails() {
        let mut manager = CorrelationManager::new();
        let id = manager.assign(meta(7, true), None);
        manager.consume(id).unwrap();
        let err = manager.consume(id).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownCorrelation { correlation_id } if correlation_id == id));
    }

    #[test]
    fn consume_out_of_order() {
        let mut manager = CorrelationManager::new();
        let a = manager.assign(meta(1, true), None);
        let b = manager.assign(meta(2, true), None);
        let c = manager.assign(meta(3, true), None);

        assert_eq!(manager.consume(b).unwrap().downstream_correlation_id, 2);
        assert_eq!(manager.consume(a).unwrap().downstream_correlation_id, 1);
        assert_eq!(manager.consume(c).unwrap().downstream_correlation_id, 3);
        assert!(manager.is_empty());
    }

    #[test]
    fn sub_request_entries_always_decode() {
        let mut manager = CorrelationManager::new();
        let (tx, _rx) = oneshot::channel();
        let id = manager.assign(meta(0, true), Some(tx));
        let entry = manager.consume(id).unwrap();
        assert!(entry.decode_response);
        assert!(entry.promise.is_some());
    }

    #[tokio::test]
    async fn cancel_all_fails_pending_promises() {
        let mut manager = CorrelationManager::new();
        let (tx, rx) = oneshot::channel();
        manager.assign(meta(9, true), Some(tx));
        manager.assign(meta(10, true), None);

        manager.cancel_all("broker went away");
        assert!(manager.is_empty());

        let result = rx.await.expect("promise completed, not dropped");
        let err = result.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamClosed { .. }));
        assert!(format!("{err}").contains("broker went away"));
    }
}
