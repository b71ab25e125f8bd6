//! Progress signals pushed by the orchestrator.

use crate::error::NetError;

/// Four-signal progress sink.
///
/// The orchestrator holds reporters weakly: if the reporter is dropped while
/// a session runs, the remaining signals are silently discarded.
pub trait ProgressReporter: Send + Sync {
    /// A new phase of the run started (e.g. "Downloading consent videos").
    fn phase(&self, text: &str);

    /// Free-form detail about the current phase.
    fn description(&self, text: &str);

    /// Operations enqueued but not yet completed.
    fn pending(&self, count: u64);

    /// The session finished. `None` means full success. Called exactly once,
    /// as the last signal of a session.
    fn done(&self, error: Option<&NetError>);
}
