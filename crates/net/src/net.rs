//! Session orchestrator.
//!
//! A [`Net`] owns one transfer run. `download()`/`upload()` spawn the
//! session's actor task, which owns the object graph and processes every
//! operation completion in order. Other contexts only touch the shared
//! counters and the first-error latch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use portalsync_graph::{EntityHook, ObjectGraph};
use portalsync_protocol::{ErrorCode, NetError, ProgressReporter};

use crate::config::NetConfig;
use crate::queue::{OperationQueue, Outcome};
use crate::session::{ItemCallback, Session};
use crate::transport::Transport;

/// Top-level completion: `None` on full success.
pub type Completion = Box<dyn FnOnce(Option<NetError>) + Send>;

/// The work a session enumerates.
///
/// Both methods run on the session's actor with the graph available; they
/// enqueue operations and return. An error kills the session.
pub trait Workload: Send + 'static {
    fn download(&mut self, session: &mut Session) -> Result<(), NetError> {
        let _ = session;
        Ok(())
    }

    fn upload(&mut self, session: &mut Session) -> Result<(), NetError> {
        let _ = session;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub(crate) fn phase(self) -> &'static str {
        match self {
            Direction::Download => "Downloading",
            Direction::Upload => "Uploading",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Messages processed by the actor.
pub(crate) enum Command {
    Finished {
        outcome: Outcome,
        callback: ItemCallback,
    },
    /// A fatal error was latched outside the actor; roll back.
    Abort,
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// State touched from arbitrary contexts.
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) config: NetConfig,
    pub(crate) queue: OperationQueue,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) sent: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) terminated: AtomicBool,
    cancel: CancellationToken,
    first_error: OnceLock<NetError>,
    next_op: AtomicU64,
}

impl Shared {
    /// Stores `error` if no error is stored yet and cancels the session.
    /// Returns whether this call won the latch.
    pub(crate) fn latch(&self, error: NetError) -> bool {
        let code = error.code();
        match self.first_error.set(error) {
            Ok(()) => {
                let description = self.first_error.get().map(NetError::description);
                if code == ErrorCode::Cancelled {
                    info!(session = %self.id, "session cancelled");
                } else {
                    error!(
                        session = %self.id,
                        code = %code,
                        description = description.unwrap_or_default(),
                        "fatal error, cancelling session"
                    );
                }
                self.cancel.cancel();
                true
            }
            Err(suppressed) => {
                debug!(
                    session = %self.id,
                    code = %suppressed.code(),
                    "secondary error suppressed"
                );
                false
            }
        }
    }

    pub(crate) fn error(&self) -> Option<&NetError> {
        self.first_error.get()
    }

    pub(crate) fn pending(&self) -> u64 {
        let sent = self.sent.load(Ordering::SeqCst);
        sent.saturating_sub(self.completed.load(Ordering::SeqCst))
    }

    pub(crate) fn next_op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ---------------------------------------------------------------------------
// Net
// ---------------------------------------------------------------------------

struct Idle {
    session: Session,
    workload: Box<dyn Workload>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Orchestrates one download or upload run.
pub struct Net {
    shared: Arc<Shared>,
    idle: Mutex<Option<Idle>>,
    actor: Mutex<Option<JoinHandle<ObjectGraph>>>,
}

impl Net {
    /// Binds a session to a graph, a workload, and its completion.
    ///
    /// Must be called within a Tokio runtime. `completion` runs exactly
    /// once, on the session's actor, after the last operation completed.
    pub fn new(
        config: NetConfig,
        transport: Arc<dyn Transport>,
        graph: ObjectGraph,
        workload: impl Workload,
        completion: impl FnOnce(Option<NetError>) + Send + 'static,
    ) -> Self {
        let cancel = CancellationToken::new();
        let queue = OperationQueue::new(transport, &config, cancel.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            config,
            queue,
            commands: tx,
            sent: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            cancel,
            first_error: OnceLock::new(),
            next_op: AtomicU64::new(0),
        });
        let session = Session::new(shared.clone(), graph, Box::new(completion));
        Self {
            shared,
            idle: Mutex::new(Some(Idle {
                session,
                workload: Box::new(workload),
                commands: rx,
            })),
            actor: Mutex::new(None),
        }
    }

    /// Sends progress to `reporter` without keeping it alive.
    pub fn with_reporter<R: ProgressReporter + 'static>(mut self, reporter: &Arc<R>) -> Self {
        let weak: Weak<R> = Arc::downgrade(reporter);
        let weak: Weak<dyn ProgressReporter> = weak;
        if let Some(idle) = self.idle.get_mut().unwrap().as_mut() {
            idle.session.set_reporter(weak);
        }
        self
    }

    /// Builds nodes through `hook` instead of copying every field.
    pub fn with_hook(mut self, hook: impl EntityHook + 'static) -> Self {
        if let Some(idle) = self.idle.get_mut().unwrap().as_mut() {
            idle.session.set_hook(Box::new(hook));
        }
        self
    }

    /// Adds a header to every request of the session.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(idle) = self.idle.get_mut().unwrap().as_mut() {
            idle.session.add_header(name.into(), value.into());
        }
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    /// Starts the workload's download. Returns `false` if the session was
    /// already started, terminated, or cancelled.
    pub fn download(&self) -> bool {
        self.start(Direction::Download)
    }

    /// Starts the workload's upload. Same contract as [`Net::download`].
    pub fn upload(&self) -> bool {
        self.start(Direction::Upload)
    }

    fn start(&self, direction: Direction) -> bool {
        if self.shared.terminated.load(Ordering::SeqCst) {
            warn!(session = %self.shared.id, "refusing to start: session terminated");
            return false;
        }
        if self.shared.cancel.is_cancelled() {
            warn!(session = %self.shared.id, "refusing to start: session cancelling");
            return false;
        }
        let Some(idle) = self.idle.lock().unwrap().take() else {
            warn!(session = %self.shared.id, "refusing to start: session already started");
            return false;
        };

        info!(
            session = %self.shared.id,
            %direction,
            base_url = %self.shared.config.base_url,
            max_connections = self.shared.config.max_connections,
            "session starting"
        );
        let handle = tokio::spawn(run_actor(idle, direction));
        *self.actor.lock().unwrap() = Some(handle);
        true
    }

    /// Cancels the session from any context. The completion receives a
    /// `Cancelled` error unless a fatal error was recorded first.
    pub fn cancel(&self) {
        self.die_with_error(NetError::cancelled("cancelled by user"));
    }

    /// Records a fatal error from any context. Only the first error of a
    /// session is kept.
    pub fn die_with_error(&self, error: NetError) {
        if self.shared.latch(error) {
            let _ = self.shared.commands.send(Command::Abort);
        }
    }

    pub fn die(&self, code: ErrorCode, description: impl Into<String>) {
        self.die_with_error(NetError::new(code, description));
    }

    pub fn is_cancelling(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// The latched first error, if any.
    pub fn error(&self) -> Option<NetError> {
        self.shared.error().cloned()
    }

    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        self.shared.pending()
    }

    /// Waits for the session to finish and hands back the graph.
    ///
    /// For a session that was never started, returns the graph untouched.
    /// Returns `None` if the graph was already handed out.
    pub async fn wait(&self) -> Option<ObjectGraph> {
        let handle = self.actor.lock().unwrap().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(graph) => Some(graph),
                Err(e) => {
                    error!(session = %self.shared.id, error = %e, "session task failed");
                    None
                }
            },
            None => self
                .idle
                .lock()
                .unwrap()
                .take()
                .map(|idle| idle.session.into_graph()),
        }
    }
}

async fn run_actor(idle: Idle, direction: Direction) -> ObjectGraph {
    let Idle {
        mut session,
        mut workload,
        mut commands,
    } = idle;

    session.enumerate(direction, workload.as_mut());
    session.check_drained();

    while !session.is_finished() {
        let Some(command) = commands.recv().await else {
            break;
        };
        match command {
            Command::Finished { outcome, callback } => session.on_finished(outcome, callback),
            Command::Abort => session.rollback_once(),
        }
        session.check_drained();
    }
    session.into_graph()
}
