use std::time::Duration;

/// Per-exchange timeout used when the configuration does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Concurrent network exchanges per session.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Retries granted to a retryable failure before it becomes fatal.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Initial backoff before the first retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Backoff cap between retries.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Content type attached to JSON request bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type attached to raw upload bodies.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest server message kept in an error description.
pub const MAX_ERROR_BODY: usize = 512;
