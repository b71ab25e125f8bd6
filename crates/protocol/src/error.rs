//! Typed network errors.
//!
//! A [`NetError`] is the only error value that crosses an operation's
//! callback boundary. Raw errors (I/O, JSON, HTTP client) are translated into
//! one exactly once through [`Classify`]; classifying a `NetError` again
//! returns it unchanged.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ERROR_BODY;

/// Closed set of error classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session was cancelled, by the user or by a cascade after a fatal error.
    Cancelled,
    /// The portal rejected the credentials.
    Login,
    /// The connection could not be established.
    Connection,
    /// The connection dropped mid-exchange.
    Disconnected,
    /// The exchange exceeded its timeout.
    Timeout,
    /// The portal answered with a non-2xx status.
    Http,
    /// The portal reported an application-level error in its payload.
    Server,
    /// A payload could not be parsed or lacked a required field.
    Json,
    /// The local graph could not be committed.
    Storage,
    /// A local file could not be written, read, or verified.
    File,
}

impl ErrorCode {
    /// All codes, in declaration order.
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::Cancelled,
        ErrorCode::Login,
        ErrorCode::Connection,
        ErrorCode::Disconnected,
        ErrorCode::Timeout,
        ErrorCode::Http,
        ErrorCode::Server,
        ErrorCode::Json,
        ErrorCode::Storage,
        ErrorCode::File,
    ];

    /// Transport-layer transients; these are retried before becoming fatal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Connection | ErrorCode::Disconnected | ErrorCode::Timeout | ErrorCode::Http
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Login => "login",
            ErrorCode::Connection => "connection",
            ErrorCode::Disconnected => "disconnected",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Http => "http",
            ErrorCode::Server => "server",
            ErrorCode::Json => "json",
            ErrorCode::Storage => "storage",
            ErrorCode::File => "file",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error: a code from the closed set plus a human description.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code} error: {description}")]
pub struct NetError {
    code: ErrorCode,
    description: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl NetError {
    /// Creates an error with the given code and description.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            source: None,
        }
    }

    /// Creates an error wrapping the underlying cause.
    pub fn with_source(
        code: ErrorCode,
        description: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            description: description.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The error every cancelled operation reports.
    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, description)
    }

    /// Classifies a non-2xx response.
    ///
    /// 401 and 403 are login failures; every other status is `Http`. The
    /// server's message body is preferred over the bare status line.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let code = match status {
            401 | 403 => ErrorCode::Login,
            _ => ErrorCode::Http,
        };
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        let description = if text.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", truncate(text, MAX_ERROR_BODY))
        };
        Self::new(code, description)
    }

    /// Extracts a server-reported error from a JSON payload of the form
    /// `{"error": "..."}`.
    pub fn from_server_payload(value: &serde_json::Value) -> Option<Self> {
        let message = value.as_object()?.get("error")?;
        let text = match message {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(Self::new(ErrorCode::Server, truncate(&text, MAX_ERROR_BODY)))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Translation of a raw error into a [`NetError`].
pub trait Classify {
    fn classify(self) -> NetError;
}

impl Classify for NetError {
    fn classify(self) -> NetError {
        self
    }
}

impl Classify for std::io::Error {
    fn classify(self) -> NetError {
        let description = self.to_string();
        NetError::with_source(ErrorCode::File, description, self)
    }
}

impl Classify for serde_json::Error {
    fn classify(self) -> NetError {
        let description = format!("malformed payload: {self}");
        NetError::with_source(ErrorCode::Json, description, self)
    }
}
