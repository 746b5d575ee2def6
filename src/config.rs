//! Proxy runtime settings.
//!
//! The crate does not read files, flags or environment variables; whatever
//! layer embeds the proxy materializes a [`ProxyConfig`] (the struct derives
//! `Deserialize`, so any serde format works) and passes it down.

use std::time::Duration;

use serde::Deserialize;

use crate::proxy::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FILTER_TIMEOUT_MS, DEFAULT_MAX_FRAME_SIZE,
};
use crate::proxy::error::{ProxyError, Result};

/// Settings for the per-connection data plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Upper bound for the length prefix of any frame, in bytes. Frames
    /// announcing more are rejected without allocation.
    pub max_frame_size: i32,

    /// Deadline for a single filter hook invocation, in milliseconds.
    /// Out-of-band sub-request futures share this deadline.
    pub filter_timeout_ms: u64,

    /// Deadline for the upstream TCP connect and TLS handshake, in
    /// milliseconds.
    pub connect_timeout_ms: u64,

    /// When true the proxy answers `ApiVersions` requests itself from the
    /// canned response and keeps the client connection available for
    /// upstream selection on the following request.
    pub authentication_offload: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            filter_timeout_ms: DEFAULT_FILTER_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            authentication_offload: false,
        }
    }
}

impl ProxyConfig {
    /// Check that every setting is inside its legal range.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size <= 0 {
            return Err(ProxyError::InvalidConfig {
                key: "max_frame_size",
                message: format!("must be positive, got {}", self.max_frame_size),
            });
        }
        if self.filter_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig {
                key: "filter_timeout_ms",
                message: "must be non-zero".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig {
                key: "connect_timeout_ms",
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
