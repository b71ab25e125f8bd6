//! Scripted transport for tests.
//!
//! Each URL has a script of replies. Requests consume the script in order;
//! the last reply repeats once the script is down to one entry. Unknown URLs
//! answer 404.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portalsync_protocol::{ErrorCode, NetError, Request};

use crate::transport::{BoxFuture, BytesBody, Response, ResponseBody, Transport};

/// How the scripted transport answers one request.
#[derive(Clone)]
pub enum Reply {
    /// A response with this status and body.
    Status(u16, Vec<u8>),
    /// A 200 response whose body arrives in these slices.
    Chunks(Vec<Vec<u8>>),
    /// Like `Chunks`, with a pause before each slice.
    Paced(Duration, Vec<Vec<u8>>),
    /// The exchange fails before a response head arrives.
    Fail(ErrorCode),
    /// A 200 response that delivers `Vec<u8>` and then drops with the code.
    FailMidBody(Vec<u8>, ErrorCode),
    /// Never answers.
    Hang,
    /// Waits, then answers.
    Delay(Duration, Box<Reply>),
    /// Waits until the predicate holds, then answers.
    When(Arc<dyn Fn() -> bool + Send + Sync>, Box<Reply>),
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Reply::Status(200, body.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Reply::Status(200, value.to_string().into_bytes())
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Reply::Status(status, body.into())
    }

    /// This reply, delayed.
    pub fn after(self, delay: Duration) -> Self {
        Reply::Delay(delay, Box::new(self))
    }

    /// This reply, once `ready` returns true.
    pub fn when(self, ready: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Reply::When(Arc::new(ready), Box::new(self))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Status(status, body) => write!(f, "Status({status}, {} bytes)", body.len()),
            Reply::Chunks(chunks) => write!(f, "Chunks({})", chunks.len()),
            Reply::Paced(pause, chunks) => write!(f, "Paced({pause:?}, {})", chunks.len()),
            Reply::Fail(code) => write!(f, "Fail({code})"),
            Reply::FailMidBody(body, code) => {
                write!(f, "FailMidBody({} bytes, {code})", body.len())
            }
            Reply::Hang => f.write_str("Hang"),
            Reply::Delay(delay, reply) => write!(f, "Delay({delay:?}, {reply:?})"),
            Reply::When(_, reply) => write!(f, "When({reply:?})"),
        }
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<Request>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `reply` to the script for `url`.
    pub fn route(self, url: impl Into<String>, reply: Reply) -> Self {
        self.push(url, reply);
        self
    }

    /// Appends `reply` to the script for `url` on a shared transport.
    pub fn push(&self, url: impl Into<String>, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(reply);
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// Requests seen for `url`.
    pub fn count(&self, url: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.url == url).count()
    }

    /// Highest number of exchanges that were awaiting a response at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Reply::Hang),
            Some(script) => script.front().cloned().unwrap_or(Reply::Hang),
            None => Reply::status(404, format!("no route for {url}")),
        }
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        Box::pin(async move {
            self.log.lock().unwrap().push(request.clone());
            let reply = self.next_reply(&request.url);

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let _guard = ActiveGuard(&self.active);

            answer(reply).await
        })
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn answer(reply: Reply) -> BoxFuture<'static, Result<Response, NetError>> {
    Box::pin(async move {
        match reply {
            Reply::Status(status, body) => Ok(Response::new(status, BytesBody::new(body))),
            Reply::Chunks(chunks) => Ok(Response::new(200, ChunkedBody(chunks.into()))),
            Reply::Paced(pause, chunks) => Ok(Response::new(
                200,
                PacedBody {
                    pause,
                    chunks: chunks.into(),
                },
            )),
            Reply::Fail(code) => Err(NetError::new(code, "scripted failure")),
            Reply::FailMidBody(body, code) => Ok(Response::new(
                200,
                BrokenBody {
                    head: Some(body),
                    code,
                },
            )),
            Reply::Hang => std::future::pending().await,
            Reply::Delay(delay, reply) => {
                tokio::time::sleep(delay).await;
                answer(*reply).await
            }
            Reply::When(ready, reply) => {
                while !ready() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                answer(*reply).await
            }
        }
    })
}

struct ChunkedBody(VecDeque<Vec<u8>>);

impl ResponseBody for ChunkedBody {
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>> {
        let next = self.0.pop_front();
        Box::pin(async move { Ok(next) })
    }
}

struct PacedBody {
    pause: Duration,
    chunks: VecDeque<Vec<u8>>,
}

impl ResponseBody for PacedBody {
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>> {
        Box::pin(async move {
            if self.chunks.is_empty() {
                return Ok(None);
            }
            tokio::time::sleep(self.pause).await;
            Ok(self.chunks.pop_front())
        })
    }
}

struct BrokenBody {
    head: Option<Vec<u8>>,
    code: ErrorCode,
}

impl ResponseBody for BrokenBody {
    fn chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, NetError>> {
        let next = match self.head.take() {
            Some(head) => Ok(Some(head)),
            None => Err(NetError::new(self.code, "connection dropped mid-body")),
        };
        Box::pin(async move { next })
    }
}
