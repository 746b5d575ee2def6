//! The per-connection data plane: codecs, correlation tracking, filter
//! runtime and the frontend/backend connection state machines.
//!
//! Module organization:
//! - `frame`: opaque and decoded request/response frame model
//! - `codec`: framing codecs, correlation manager, decode predicate
//! - `filter`: filter SPI, filter results, chain runtime, filter context
//! - `frontend` / `backend`: client-facing and broker-facing connection logic
//! - `haproxy`: PROXY-protocol preamble parsing
//! - `cluster`: consumed descriptors (virtual cluster, NetFilter SPI)
//! - `listener`: accept loop

pub mod api_versions;
pub mod backend;
pub mod cluster;
pub mod codec;
pub mod constants;
pub mod error;
pub mod filter;
pub mod frame;
pub mod frontend;
pub mod haproxy;
pub mod listener;

pub use error::{ProxyError, Result};
pub use frame::{
    DecodedRequestFrame, DecodedResponseFrame, OpaqueRequestFrame, OpaqueResponseFrame,
    RequestFrame, ResponseFrame,
};
pub use listener::run as run_listener;
