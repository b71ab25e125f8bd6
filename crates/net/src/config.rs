//! Session configuration.

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use portalsync_protocol::ErrorCode;
use portalsync_protocol::constants::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_RETRY_DELAY, DEFAULT_MAX_TRIES, DEFAULT_RETRY_DELAY,
    DEFAULT_TIMEOUT,
};

/// Settings for one orchestrated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Portal base address, without a trailing slash.
    #[serde(default)]
    pub base_url: String,

    /// Longest wait for a response head or the next body chunk, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Concurrent network exchanges.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Commit the graph every N successful items (0 = explicit saves and
    /// the final commit only).
    #[serde(default)]
    pub chunk_size: u64,

    /// Fault injection, for orchestrator tests only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultConfig>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
            max_connections: default_max_connections(),
            retry: RetryPolicy::default(),
            chunk_size: 0,
            fault: None,
        }
    }
}

impl NetConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Joins `path` onto the base address.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

/// Everything but RFC 3986 unreserved characters.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes one path segment.
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How retryable failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries granted after the first attempt. An operation runs at most
    /// `max_tries + 1` times.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRIES
}

fn default_initial_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_RETRY_DELAY.as_millis() as u64
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_tries: 0,
            ..Self::default()
        }
    }

    /// `max_tries` retries with no delay between attempts.
    pub fn immediate(max_tries: u32) -> Self {
        Self {
            max_tries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

// ---------------------------------------------------------------------------
// FaultConfig
// ---------------------------------------------------------------------------

/// How the fault injector picks the exchanges it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// Every `rate`-th successful exchange fails.
    Every,
    /// Each successful exchange fails with probability `1/rate`.
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    pub rate: u32,

    #[serde(default = "default_fault_mode")]
    pub mode: FaultMode,

    /// Seed for [`FaultMode::Random`]; a random seed is drawn when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Code of the manufactured failures.
    #[serde(default = "default_fault_code")]
    pub code: ErrorCode,
}

fn default_fault_mode() -> FaultMode {
    FaultMode::Every
}

fn default_fault_code() -> ErrorCode {
    ErrorCode::Connection
}

impl FaultConfig {
    /// Fails every `rate`-th successful exchange with a `Connection` error.
    pub fn every(rate: u32) -> Self {
        Self {
            rate,
            mode: FaultMode::Every,
            seed: None,
            code: default_fault_code(),
        }
    }
}
