//! The graph-owning side of a session.
//!
//! A [`Session`] lives on the session's single actor task. Workloads and
//! item callbacks receive `&mut Session`; every graph mutation, commit,
//! rollback, and the final completion happen here.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use portalsync_graph::{EntityHook, NodeId, ObjectGraph};
use portalsync_protocol::{Classify, ErrorCode, NetError, ProgressReporter, Request};
use portalsync_transfer::SinkKind;

use crate::config::{NetConfig, encode_segment};
use crate::net::{Command, Completion, Direction, Shared, Workload};
use crate::operation::{Finished, Operation};
use crate::queue::Outcome;

/// What the orchestrator should do with a finished item.
#[derive(Debug)]
pub enum Signal {
    /// The item is handled.
    Done,
    /// Run the exchange again; `NetError` becomes fatal once retries are spent.
    Retry(NetError),
    /// Fatal: roll back and cancel the session.
    Die(NetError),
}

impl From<Result<(), NetError>> for Signal {
    fn from(result: Result<(), NetError>) -> Self {
        match result {
            Ok(()) => Signal::Done,
            Err(error) => Signal::Die(error),
        }
    }
}

/// Per-item completion callback.
pub type ItemCallback = Box<dyn FnMut(&mut Session, Finished) -> Signal + Send>;

type CommitAction = Box<dyn FnOnce(&mut Session) + Send>;
type RollbackAction = Box<dyn FnOnce() + Send>;

pub struct Session {
    shared: Arc<Shared>,
    graph: ObjectGraph,
    hook: Box<dyn EntityHook>,
    reporter: Option<Weak<dyn ProgressReporter>>,
    headers: Vec<(String, String)>,
    completion: Option<Completion>,
    on_commit: Vec<CommitAction>,
    on_rollback: Vec<RollbackAction>,
    enumerating: bool,
    rolled_back: bool,
    since_commit: u64,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, graph: ObjectGraph, completion: Completion) -> Self {
        Self {
            shared,
            graph,
            hook: Box::new(insert_all_fields),
            reporter: None,
            headers: Vec::new(),
            completion: Some(completion),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            enumerating: true,
            rolled_back: false,
            since_commit: 0,
        }
    }

    pub(crate) fn set_hook(&mut self, hook: Box<dyn EntityHook>) {
        self.hook = hook;
    }

    pub(crate) fn set_reporter(&mut self, reporter: Weak<dyn ProgressReporter>) {
        self.reporter = Some(reporter);
    }

    pub(crate) fn add_header(&mut self, name: String, value: String) {
        self.headers.push((name, value));
    }

    pub(crate) fn into_graph(self) -> ObjectGraph {
        self.graph
    }

    // -- state ---------------------------------------------------------------

    pub fn config(&self) -> &NetConfig {
        &self.shared.config
    }

    /// Absolute URL for a portal path.
    pub fn url(&self, path: &str) -> String {
        self.shared.config.url(path)
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// Direct graph access. Refused once the session has died.
    pub fn graph_mut(&mut self) -> Result<&mut ObjectGraph, NetError> {
        self.ensure_alive()?;
        Ok(&mut self.graph)
    }

    /// Whether a fatal error (or a cancel) has been latched.
    pub fn is_dead(&self) -> bool {
        self.shared.error().is_some()
    }

    pub fn error(&self) -> Option<&NetError> {
        self.shared.error()
    }

    /// Operations enqueued and not yet completed.
    pub fn pending(&self) -> u64 {
        self.shared.pending()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.completion.is_none()
    }

    fn ensure_alive(&self) -> Result<(), NetError> {
        match self.shared.error() {
            Some(_) => Err(NetError::cancelled("session already failed")),
            None => Ok(()),
        }
    }

    // -- progress ------------------------------------------------------------

    fn reporter(&self) -> Option<Arc<dyn ProgressReporter>> {
        self.reporter.as_ref()?.upgrade()
    }

    pub fn phase(&self, text: &str) {
        if let Some(r) = self.reporter() {
            r.phase(text);
        }
    }

    pub fn description(&self, text: &str) {
        if let Some(r) = self.reporter() {
            r.description(text);
        }
    }

    fn report_pending(&self) {
        if let Some(r) = self.reporter() {
            r.pending(self.pending());
        }
    }

    // -- enqueue -------------------------------------------------------------

    /// Enqueues an exchange. Returns `false` once the session has died.
    pub fn add(
        &mut self,
        request: Request,
        sink: SinkKind,
        callback: impl FnMut(&mut Session, Finished) -> Signal + Send + 'static,
    ) -> bool {
        if self.is_dead() {
            debug!(request = %request.describe(), "not enqueued: session already failed");
            return false;
        }
        let mut request = request;
        for (name, value) in &self.headers {
            if request.header_value(name).is_none() {
                request.headers.push((name.clone(), value.clone()));
            }
        }

        let id = self.shared.next_op_id();
        let operation = Operation::new(id, request, sink, self.shared.config.retry.max_tries);
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        debug!(op = id, request = %operation.request().describe(), "enqueued");

        self.launch(operation, Duration::ZERO, Box::new(callback));
        self.report_pending();
        true
    }

    /// Enqueues an exchange whose body is buffered in memory.
    pub fn add_data(
        &mut self,
        request: Request,
        callback: impl FnMut(&mut Session, Finished) -> Signal + Send + 'static,
    ) -> bool {
        self.add(request, SinkKind::Memory, callback)
    }

    /// Enqueues an exchange whose body is streamed to `path`.
    pub fn add_file(
        &mut self,
        request: Request,
        path: impl Into<PathBuf>,
        callback: impl FnMut(&mut Session, Finished) -> Signal + Send + 'static,
    ) -> bool {
        self.add(request, SinkKind::File(path.into()), callback)
    }

    /// Enqueues an upload of raw bytes; the response is buffered.
    pub fn add_upload(
        &mut self,
        request: Request,
        data: Vec<u8>,
        callback: impl FnMut(&mut Session, Finished) -> Signal + Send + 'static,
    ) -> bool {
        self.add(request.bytes(data), SinkKind::Memory, callback)
    }

    /// Tells the portal that `identifier` from `table` was received.
    pub fn ack(&mut self, table: &str, identifier: &str) -> bool {
        let url = self.url(&format!(
            "ack/{}/{}",
            encode_segment(table),
            encode_segment(identifier)
        ));
        self.add_data(Request::post(url), |_, _| Signal::Done)
    }

    fn launch(&self, operation: Operation, delay: Duration, callback: ItemCallback) {
        let commands = self.shared.commands.clone();
        self.shared
            .queue
            .submit_after(operation, delay, move |outcome| {
                let _ = commands.send(Command::Finished { outcome, callback });
            });
    }

    /// Runs a finished item's exchange again without taking a new slot.
    /// Returns `false` when no retry was scheduled.
    fn retry(&mut self, operation: &Operation, reason: NetError, callback: ItemCallback) -> bool {
        if self.is_dead() {
            return false;
        }
        match operation.retried() {
            Some(next) => {
                let delay = self.shared.config.retry.delay_for_attempt(next.tries());
                warn!(
                    op = next.id(),
                    url = %next.url(),
                    attempt = next.tries() + 1,
                    reason = %reason,
                    "item rejected, retrying"
                );
                self.launch(next, delay, callback);
                true
            }
            None => {
                self.die_with_error(reason);
                false
            }
        }
    }

    // -- fatal errors --------------------------------------------------------

    /// Records a fatal error. Only the first error of a session is kept; the
    /// first caller also rolls back and cancels every other operation.
    pub fn die_with_error(&mut self, error: NetError) {
        if self.shared.latch(error) {
            self.rollback_once();
        }
    }

    pub fn die(&mut self, code: ErrorCode, description: impl Into<String>) {
        self.die_with_error(NetError::new(code, description));
    }

    pub(crate) fn rollback_once(&mut self) {
        if self.rolled_back {
            return;
        }
        self.rolled_back = true;
        self.graph.rollback();
        self.on_commit.clear();
        for action in std::mem::take(&mut self.on_rollback) {
            action();
        }
    }

    // -- commits -------------------------------------------------------------

    /// Runs `action` once the changes made so far are committed. Dropped if
    /// they are rolled back instead.
    pub fn after_commit(&mut self, action: impl FnOnce(&mut Session) + Send + 'static) {
        if !self.is_dead() {
            self.on_commit.push(Box::new(action));
        }
    }

    /// Runs `action` if the changes made so far are rolled back. Dropped once
    /// they are committed.
    pub fn after_rollback(&mut self, action: impl FnOnce() + Send + 'static) {
        if self.rolled_back {
            action();
        } else {
            self.on_rollback.push(Box::new(action));
        }
    }

    /// Commits the current chunk. A failed commit kills the session with a
    /// `Storage` error; returns whether the chunk was committed.
    pub fn save(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        match self.graph.save() {
            Ok(()) => {
                self.since_commit = 0;
                self.on_rollback.clear();
                for action in std::mem::take(&mut self.on_commit) {
                    action(self);
                }
                true
            }
            Err(e) => {
                self.die_with_error(e.classify());
                false
            }
        }
    }

    fn item_done(&mut self) {
        let chunk_size = self.shared.config.chunk_size;
        if chunk_size == 0 || self.is_dead() {
            return;
        }
        self.since_commit += 1;
        if self.since_commit >= chunk_size {
            self.save();
        }
    }

    // -- graph helpers -------------------------------------------------------

    /// Builds a node through the entity hook.
    pub fn new_node(&mut self, entity: &str, fields: &Map<String, Value>) -> Result<NodeId, NetError> {
        self.ensure_alive()?;
        self.hook
            .construct(&mut self.graph, entity, fields)
            .map_err(Classify::classify)
    }

    /// Required field of a payload dictionary; absent or `null` is a `Json` error.
    pub fn value_for_key<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a Value, NetError> {
        match fields.get(key) {
            None | Some(Value::Null) => Err(NetError::new(
                ErrorCode::Json,
                format!("missing required field `{key}`"),
            )),
            Some(value) => Ok(value),
        }
    }

    /// Adds `target` to `owner.relation`.
    pub fn link(&mut self, owner: NodeId, relation: &str, target: NodeId) -> Result<(), NetError> {
        self.ensure_alive()?;
        self.graph
            .link(owner, relation, target)
            .map_err(Classify::classify)
    }

    /// Adds `node` to `owner.relation`, deleting any other member with the
    /// same `key` value.
    pub fn update_set(
        &mut self,
        owner: NodeId,
        relation: &str,
        key: &str,
        node: NodeId,
    ) -> Result<(), NetError> {
        self.ensure_alive()?;
        let value = self
            .graph
            .get(node)
            .and_then(|n| n.attr(key))
            .cloned()
            .ok_or_else(|| {
                NetError::new(ErrorCode::Json, format!("node {node} has no `{key}` field"))
            })?;

        let replaced: Vec<NodeId> = self
            .members_where(owner, relation, key, &value)
            .into_iter()
            .filter(|id| *id != node)
            .collect();
        for id in replaced {
            self.graph.delete(id);
        }
        self.link(owner, relation, node)
    }

    /// Deletes every member of `owner.relation` whose `key` equals `value`.
    pub fn remove_from_set(
        &mut self,
        owner: NodeId,
        relation: &str,
        key: &str,
        value: &Value,
    ) -> Result<usize, NetError> {
        self.ensure_alive()?;
        let doomed = self.members_where(owner, relation, key, value);
        for id in &doomed {
            self.graph.delete(*id);
        }
        Ok(doomed.len())
    }

    /// Reconciles `owner.relation` with an incoming listing.
    ///
    /// A member whose `node_key` matches no item's `item_key` is deleted. A
    /// member whose matching item carries a different `hash_key` is deleted
    /// and the item kept, so it is fetched again. An item matching a member
    /// with the same hash is removed from `incoming`. Returns the number of
    /// deleted members.
    pub fn delete_matches(
        &mut self,
        owner: NodeId,
        relation: &str,
        incoming: &mut Vec<Map<String, Value>>,
        node_key: &str,
        item_key: &str,
        hash_key: Option<&str>,
    ) -> Result<usize, NetError> {
        self.ensure_alive()?;
        let mut deleted = 0;
        for member in self.graph.related(owner, relation) {
            let Some(node) = self.graph.get(member) else {
                continue;
            };
            let key = node.attr(node_key).cloned();
            let hash = hash_key.and_then(|h| node.attr(h)).cloned();

            let matched = key.as_ref().and_then(|key| {
                incoming
                    .iter()
                    .position(|item| item.get(item_key) == Some(key))
            });
            match matched {
                Some(index) => {
                    let unchanged = match hash_key {
                        Some(h) => incoming[index].get(h) == hash.as_ref(),
                        None => true,
                    };
                    if unchanged {
                        incoming.remove(index);
                    } else {
                        self.graph.delete(member);
                        deleted += 1;
                    }
                }
                None => {
                    self.graph.delete(member);
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            debug!(relation, deleted, remaining = incoming.len(), "stale members removed");
        }
        Ok(deleted)
    }

    /// `{id_key, hash_key}` pairs of every member of `owner.relation`.
    pub fn hashes_from_set(
        &self,
        owner: NodeId,
        relation: &str,
        id_key: &str,
        hash_key: &str,
    ) -> Vec<Value> {
        self.graph
            .related(owner, relation)
            .into_iter()
            .filter_map(|id| self.graph.get(id))
            .map(|node| {
                let mut pair = Map::new();
                pair.insert(
                    id_key.to_string(),
                    node.attr(id_key).cloned().unwrap_or(Value::Null),
                );
                pair.insert(
                    hash_key.to_string(),
                    node.attr(hash_key).cloned().unwrap_or(Value::Null),
                );
                Value::Object(pair)
            })
            .collect()
    }

    fn members_where(&self, owner: NodeId, relation: &str, key: &str, value: &Value) -> Vec<NodeId> {
        self.graph
            .related(owner, relation)
            .into_iter()
            .filter(|id| {
                self.graph
                    .get(*id)
                    .is_some_and(|n| n.attr(key) == Some(value))
            })
            .collect()
    }

    // -- actor side ----------------------------------------------------------

    pub(crate) fn enumerate(&mut self, direction: Direction, workload: &mut dyn Workload) {
        self.phase(direction.phase());
        let result = match direction {
            Direction::Download => workload.download(self),
            Direction::Upload => workload.upload(self),
        };
        if let Err(error) = result {
            self.die_with_error(error);
        }
        self.enumerating = false;
        self.report_pending();
    }

    pub(crate) fn on_finished(&mut self, outcome: Outcome, mut callback: ItemCallback) {
        match outcome {
            Ok(finished) if self.is_dead() => {
                debug!(op = finished.operation().id(), "response discarded after die");
                finished.discard();
            }
            Ok(finished) => {
                let operation = finished.operation().clone();
                match callback(self, finished) {
                    Signal::Done => self.item_done(),
                    Signal::Retry(reason) => {
                        if self.retry(&operation, reason, callback) {
                            // The retry keeps this operation's slot.
                            return;
                        }
                    }
                    Signal::Die(error) => self.die_with_error(error),
                }
            }
            Err(failed) if failed.error.is_cancelled() && self.is_dead() => {
                debug!(op = failed.operation.id(), "operation cancelled");
            }
            Err(failed) => {
                warn!(
                    op = failed.operation.id(),
                    url = %failed.operation.url(),
                    tries = failed.operation.tries(),
                    code = %failed.error.code(),
                    "operation failed"
                );
                self.die_with_error(failed.error);
            }
        }
        self.shared.completed.fetch_add(1, Ordering::SeqCst);
        self.report_pending();
    }

    /// Fires the completion once every enqueued operation has completed and
    /// enumeration is over.
    pub(crate) fn check_drained(&mut self) {
        if self.enumerating || self.completion.is_none() {
            return;
        }
        let sent = self.shared.sent.load(Ordering::SeqCst);
        let completed = self.shared.completed.load(Ordering::SeqCst);
        if sent != completed {
            return;
        }

        if !self.is_dead() && self.graph.has_changes() && self.save() {
            if self.shared.sent.load(Ordering::SeqCst) != sent {
                // The commit queued follow-up work; report once it drains.
                return;
            }
        }
        if self.is_dead() {
            // A die from another context may not have reached us yet.
            self.rollback_once();
        }

        self.shared.terminated.store(true, Ordering::SeqCst);
        let error = self.shared.error().cloned();
        match &error {
            None => info!(session = %self.shared.id, sent, "session finished"),
            Some(e) => info!(session = %self.shared.id, sent, code = %e.code(), "session finished with error"),
        }

        if let Some(completion) = self.completion.take() {
            completion(error.clone());
        }
        if let Some(r) = self.reporter() {
            r.done(error.as_ref());
        }
    }
}

fn insert_all_fields(
    graph: &mut ObjectGraph,
    entity: &str,
    fields: &Map<String, Value>,
) -> Result<NodeId, portalsync_graph::FieldError> {
    Ok(graph.insert(entity, fields.clone()))
}
