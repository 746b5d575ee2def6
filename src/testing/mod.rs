//! Test support: an in-process mock broker, a minimal wire client, and
//! scripted filters.
//!
//! Nothing here is used by the proxy itself. The integration tests drive a
//! real listener against [`mock_broker::MockBroker`]; downstream crates can
//! do the same to test their own filters end to end.

pub mod client;
pub mod filters;
pub mod mock_broker;

use async_trait::async_trait;

use crate::proxy::cluster::{ConnectionInfo, NetFilter, UpstreamTarget};
use crate::proxy::error::Result;
use crate::proxy::filter::Filter;

/// Factory producing a fresh filter chain per connection.
pub type FilterFactory = dyn Fn() -> Vec<(String, Box<dyn Filter>)> + Send + Sync;

/// A `NetFilter` that always dials the same upstream and builds the chain
/// from a factory, once per connection.
pub struct FixedNetFilter {
    host: String,
    port: u16,
    factory: Box<FilterFactory>,
}

impl FixedNetFilter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            factory: Box::new(Vec::new),
        }
    }

    pub fn with_filters(
        mut self,
        factory: impl Fn() -> Vec<(String, Box<dyn Filter>)> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }
}

#[async_trait]
impl NetFilter for FixedNetFilter {
    async fn select_server(&self, _info: &ConnectionInfo) -> Result<UpstreamTarget> {
        let mut target = UpstreamTarget::new(self.host.clone(), self.port);
        target.filters = (self.factory)();
        Ok(target)
    }
}
