//! Proxy error types.
//!
//! One enum covers every failure the data plane can hit. Variants carry the
//! context needed to log them usefully (state names, correlation ids, filter
//! names). All errors are terminal for the connection they occur on: the
//! owning connection task records them and closes. Filters observe failures
//! only as rejections of their pending sub-request futures.

use thiserror::Error;

/// Errors raised by the per-connection data plane.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A frame could not be decoded: truncated, oversized, or the body
    /// violated the schema for its api version.
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// A response arrived whose correlation id matches no in-flight request.
    #[error("response with unknown correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: i32 },

    /// The connection state machine received a message that is illegal in
    /// its current state.
    #[error("{message} (state={state})")]
    IllegalState { state: &'static str, message: String },

    /// A filter hook did not complete within its deadline.
    #[error("filter '{filter}' exceeded its {timeout_ms} ms deadline")]
    FilterTimeout { filter: String, timeout_ms: u64 },

    /// A filter hook completed with an error.
    #[error("filter '{filter}' failed: {message}")]
    FilterError { filter: String, message: String },

    /// TCP connect or TLS handshake with the upstream broker failed.
    #[error("connect to upstream {remote} failed: {message}")]
    UpstreamConnectFailure { remote: String, message: String },

    /// The broker side of the connection went away while requests were in
    /// flight.
    #[error("upstream connection closed: {message}")]
    UpstreamClosed { message: String },

    /// A frame could not be serialized back onto the wire.
    #[error("frame encode failed: {message}")]
    FrameEncode { message: String },

    /// A configuration value failed validation.
    #[error("invalid configuration '{key}': {message}")]
    InvalidConfig { key: &'static str, message: String },

    /// I/O error on either side of the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn malformed(message: impl Into<String>) -> Self {
        ProxyError::MalformedFrame {
            message: message.into(),
        }
    }

    pub fn illegal_state(state: &'static str, message: impl Into<String>) -> Self {
        ProxyError::IllegalState {
            state,
            message: message.into(),
        }
    }

    pub fn filter_error(filter: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::FilterError {
            filter: filter.into(),
            message: message.into(),
        }
    }

    pub fn upstream_connect(remote: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::UpstreamConnectFailure {
            remote: remote.into(),
            message: message.into(),
        }
    }

    pub fn upstream_closed(message: impl Into<String>) -> Self {
        ProxyError::UpstreamClosed {
            message: message.into(),
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        ProxyError::FrameEncode {
            message: message.into(),
        }
    }

    /// True for errors that are just the peer hanging up. These are logged at
    /// debug level; everything else is worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
