//! Protocol and runtime constants.
//!
//! Centralizes the magic numbers of the wire format and the default knobs of
//! the connection runtime so they have exactly one home.

/// Size of the big-endian length prefix that frames every Kafka message.
pub const FRAME_LENGTH_PREFIX: usize = 4;

/// Byte offset of the correlation id inside a request frame payload
/// (after the 2-byte api key and the 2-byte api version).
pub const REQUEST_CORRELATION_OFFSET: usize = 4;

/// Byte offset of the correlation id inside a response frame payload.
pub const RESPONSE_CORRELATION_OFFSET: usize = 0;

/// Minimum number of payload bytes a request frame must carry: api key (2),
/// api version (2) and correlation id (4).
pub const MIN_REQUEST_FRAME: usize = 8;

/// Minimum number of payload bytes a response frame must carry: the
/// correlation id.
pub const MIN_RESPONSE_FRAME: usize = 4;

/// Default maximum frame size (100 MB). Frames with a larger length prefix
/// are rejected before any allocation happens.
pub const DEFAULT_MAX_FRAME_SIZE: i32 = 100_000_000;

/// Default deadline for a single filter hook invocation, in milliseconds.
pub const DEFAULT_FILTER_TIMEOUT_MS: u64 = 20_000;

/// Default deadline for the upstream TCP connect, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Highest api key the subscription table accommodates. Kafka api keys are
/// small and dense; anything above this is unknown to the proxy and stays
/// opaque.
pub const MAX_API_KEY: usize = 128;

/// Initial capacity for the per-hook scratch buffer pool.
pub const SCRATCH_BUFFER_CAPACITY: usize = 64 * 1024;

/// Largest scratch buffer the pool will retain once a hook completes.
pub const MAX_POOLED_BUFFER_SIZE: usize = 1024 * 1024;
