//! One network exchange and its outcome.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use portalsync_protocol::constants::MAX_ERROR_BODY;
use portalsync_protocol::{Classify, ErrorCode, NetError, Request};
use portalsync_transfer::{ResponseSink, Sink, SinkKind};

use crate::fault::FaultInjector;
use crate::transport::{ResponseBody, Transport};

/// Lifecycle of an [`Operation`].
///
/// `Created -> Executing -> {Succeeded, Failed, Cancelled}`. A retry is a new
/// `Operation` value in `Created`, never a transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Created,
    Executing,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// A single request/response exchange.
///
/// Holds the request, the sink strategy, and the try counter. The sink
/// itself is opened fresh for each attempt, so a retry never sees bytes
/// from an earlier one.
#[derive(Debug, Clone)]
pub struct Operation {
    id: u64,
    request: Request,
    sink: SinkKind,
    tries: u32,
    max_tries: u32,
    state: OperationState,
}

impl Operation {
    pub fn new(id: u64, request: Request, sink: SinkKind, max_tries: u32) -> Self {
        Self {
            id,
            request,
            sink,
            tries: 0,
            max_tries,
            state: OperationState::Created,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn sink_kind(&self) -> &SinkKind {
        &self.sink
    }

    /// Retries already spent on this exchange.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// The next attempt of this exchange, or `None` once retries are used up.
    ///
    /// The request and sink strategy carry over; transport state does not.
    pub fn retried(&self) -> Option<Operation> {
        if self.tries >= self.max_tries {
            return None;
        }
        Some(Operation {
            id: self.id,
            request: self.request.clone(),
            sink: self.sink.clone(),
            tries: self.tries + 1,
            max_tries: self.max_tries,
            state: OperationState::Created,
        })
    }

    /// Runs one attempt of the exchange.
    ///
    /// The cancellation token is observed before sending, while waiting for
    /// the response, between body chunks, and once more after the body is
    /// complete; once it is observed, the outcome is `Cancelled` regardless
    /// of what the transport did.
    pub(crate) async fn perform(mut self, env: &Exchange<'_>) -> Result<Finished, Failed> {
        self.state = OperationState::Executing;
        trace!(op = self.id, attempt = self.tries + 1, url = %self.request.url, "executing");

        if env.cancel.is_cancelled() {
            return Err(self.fail(None, NetError::cancelled("session cancelled before start")));
        }

        let mut sink = match self.sink.open() {
            Ok(sink) => sink,
            Err(e) => return Err(self.fail(None, e)),
        };

        let result = tokio::select! {
            biased;
            _ = env.cancel.cancelled() => Err(NetError::cancelled("session cancelled")),
            r = exchange(&self.request, &mut sink, env) => r,
        };

        let result = result
            .and_then(|status| {
                if env.cancel.is_cancelled() {
                    Err(NetError::cancelled("session cancelled"))
                } else {
                    Ok(status)
                }
            })
            .and_then(|status| sink.finish().map(|()| status))
            .and_then(|status| match env.fault.and_then(FaultInjector::inject) {
                Some(injected) => Err(injected),
                None => Ok(status),
            });

        match result {
            Ok(status) => {
                self.state = OperationState::Succeeded;
                debug!(op = self.id, status, bytes = sink.len(), "exchange succeeded");
                Ok(Finished {
                    operation: self,
                    status,
                    sink,
                })
            }
            Err(error) => Err(self.fail(Some(sink), error)),
        }
    }

    fn fail(mut self, sink: Option<Sink>, error: NetError) -> Failed {
        if let Some(sink) = sink {
            sink.discard();
        }
        self.state = if error.is_cancelled() {
            OperationState::Cancelled
        } else {
            OperationState::Failed
        };
        Failed {
            operation: self,
            error,
        }
    }
}

/// What an attempt needs besides the operation itself.
pub(crate) struct Exchange<'a> {
    pub transport: &'a dyn Transport,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
    pub fault: Option<&'a FaultInjector>,
}

/// The timeout bounds each wait on the transport, not the whole transfer: a
/// long download that keeps delivering bytes never times out.
async fn exchange(request: &Request, sink: &mut Sink, env: &Exchange<'_>) -> Result<u16, NetError> {
    let mut response = idle(env.timeout, "no response", env.transport.send(request)).await?;
    if !response.is_success() {
        let body = idle(env.timeout, "error body stalled", response.read_to_end(MAX_ERROR_BODY + 1))
            .await
            .unwrap_or_default();
        return Err(NetError::from_status(response.status, &body));
    }

    sink.reset_data()?;
    while let Some(chunk) = idle(env.timeout, "body stalled", response.body.chunk()).await? {
        if env.cancel.is_cancelled() {
            return Err(NetError::cancelled("session cancelled mid-body"));
        }
        sink.append_data(&chunk)?;
    }
    Ok(response.status)
}

async fn idle<T>(
    timeout: Duration,
    what: &str,
    step: impl Future<Output = Result<T, NetError>>,
) -> Result<T, NetError> {
    tokio::time::timeout(timeout, step)
        .await
        .unwrap_or_else(|_| Err(NetError::new(ErrorCode::Timeout, format!("{what} for {timeout:?}"))))
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A successful exchange: the operation plus its populated sink.
#[derive(Debug)]
pub struct Finished {
    operation: Operation,
    status: u16,
    sink: Sink,
}

impl Finished {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn url(&self) -> &str {
        self.operation.url()
    }

    pub fn tries(&self) -> u32 {
        self.operation.tries()
    }

    /// HTTP status of the response.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Body bytes, for memory sinks.
    pub fn data(&self) -> Option<&[u8]> {
        self.sink.data()
    }

    /// Body bytes written, for either sink.
    pub fn len(&self) -> u64 {
        self.sink.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty()
    }

    /// Downloaded file, for file sinks.
    pub fn path(&self) -> Option<&Path> {
        self.sink.path()
    }

    /// Body as text.
    pub fn as_string(&self) -> String {
        self.data()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_default()
    }

    /// Body parsed as JSON. A `{"error": ...}` payload becomes a `Server` error.
    pub fn json(&self) -> Result<serde_json::Value, NetError> {
        let data = self.data().ok_or_else(|| {
            NetError::new(ErrorCode::Json, "response was written to a file, not buffered")
        })?;
        let value: serde_json::Value = serde_json::from_slice(data).map_err(Classify::classify)?;
        match NetError::from_server_payload(&value) {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    /// Body parsed as a JSON array.
    pub fn json_array(&self) -> Result<Vec<serde_json::Value>, NetError> {
        match self.json()? {
            serde_json::Value::Array(items) => Ok(items),
            _ => Err(NetError::new(
                ErrorCode::Json,
                format!("{}: expected a JSON array", self.url()),
            )),
        }
    }

    /// Body parsed as a JSON object.
    pub fn json_object(&self) -> Result<serde_json::Map<String, serde_json::Value>, NetError> {
        match self.json()? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(NetError::new(
                ErrorCode::Json,
                format!("{}: expected a JSON object", self.url()),
            )),
        }
    }

    /// Drops the response, removing a downloaded file.
    pub fn discard(self) {
        self.sink.discard();
    }
}

/// A failed or cancelled exchange.
#[derive(Debug)]
pub struct Failed {
    pub operation: Operation,
    pub error: NetError,
}
