//! The network seam.
//!
//! Operations talk to the portal only through [`Transport`]. The production
//! implementation is [`HttpTransport`] over `reqwest`; tests substitute a
//! scripted one.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use portalsync_protocol::{ErrorCode, Method, NetError, Request};

/// Boxed future returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Performs network exchanges.
pub trait Transport: Send + Sync {
    /// Sends `request` and resolves once the response head is available.
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>>;
}

/// Response body, read incrementally.
pub trait ResponseBody: Send {
    /// Next slice of the body, or `None` at the end.
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>>;
}

/// Status and body of a response.
pub struct Response {
    pub status: u16,
    pub body: Box<dyn ResponseBody>,
}

impl Response {
    pub fn new(status: u16, body: impl ResponseBody + 'static) -> Self {
        Self {
            status,
            body: Box::new(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the rest of the body, keeping at most `limit` bytes.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.chunk().await? {
            let room = limit.saturating_sub(out.len());
            out.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A body held entirely in memory, handed out in one slice.
#[derive(Debug, Default)]
pub struct BytesBody(Option<Vec<u8>>);

impl BytesBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Some(data.into()))
    }
}

impl ResponseBody for BytesBody {
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>> {
        let next = self.0.take().filter(|d| !d.is_empty());
        Box::pin(async move { Ok(next) })
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// `reqwest`-backed transport.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Builds a client that gives up connecting after `timeout`. Stalled
    /// responses are bounded by the operation, one wait at a time.
    pub fn new(timeout: std::time::Duration) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("portalsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(classify_reqwest)?;
        Ok(Self { http })
    }

    /// Wraps an existing client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        Box::pin(async move {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Delete => reqwest::Method::DELETE,
            };
            let mut builder = self.http.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(content_type) = request.body.content_type() {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(request.body.to_bytes());
            }

            debug!(request = %request.describe(), "sending");
            let resp = builder.send().await.map_err(classify_reqwest)?;
            Ok(Response::new(resp.status().as_u16(), ReqwestBody(resp)))
        })
    }
}

struct ReqwestBody(reqwest::Response);

impl ResponseBody for ReqwestBody {
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>> {
        Box::pin(async move {
            let chunk = self.0.chunk().await.map_err(classify_reqwest)?;
            Ok(chunk.map(|b| b.to_vec()))
        })
    }
}

/// Translates a `reqwest` error into the closed code set.
pub fn classify_reqwest(err: reqwest::Error) -> NetError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_connect() {
        ErrorCode::Connection
    } else if err.is_body() || err.is_decode() {
        ErrorCode::Disconnected
    } else {
        ErrorCode::Connection
    };
    let description = err.to_string();
    NetError::with_source(code, description, err)
}
