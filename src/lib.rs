//! krelay is a transparent, protocol-aware proxy for the Kafka wire protocol.
//!
//! Clients connect to the proxy instead of the real broker. The proxy
//! terminates the client connection, lazily decodes request and response
//! frames according to a per-connection decode predicate, runs an ordered
//! chain of interception filters over decoded frames, and forwards the
//! (possibly mutated, possibly short-circuited) traffic to an upstream broker
//! chosen per-connection by a [`proxy::cluster::NetFilter`].
//!
//! The crate is the per-connection data plane only: framing codecs, the
//! request/response correlation tracker, the frontend/backend connection
//! state machines, and the filter invocation runtime. Configuration loading,
//! address providers, downstream TLS termination and filter discovery live
//! outside and are consumed through the interfaces in [`proxy::cluster`].

pub mod config;
pub mod proxy;

// Test support: in-process mock broker and scripted filters. Used by the
// integration tests under tests/ and available to downstream crates that
// test their own filters against a live proxy.
pub mod testing;
