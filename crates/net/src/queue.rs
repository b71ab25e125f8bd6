//! Bounded-concurrency executor for operations.
//!
//! Submitted operations are dispatched in submission order, at most
//! `max_connections` at a time. Retryable failures are resubmitted with
//! backoff until the operation's retries are spent. Each submission's
//! completion runs exactly once, with the terminal outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use portalsync_protocol::NetError;

use crate::config::{NetConfig, RetryPolicy};
use crate::fault::FaultInjector;
use crate::operation::{Exchange, Failed, Finished, Operation};
use crate::transport::Transport;

/// Terminal outcome handed to a submission's completion.
pub type Outcome = Result<Finished, Failed>;

type Done = Box<dyn FnOnce(Outcome) + Send>;

struct Job {
    operation: Operation,
    done: Done,
    queue: OperationQueue,
}

struct Executor {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retry: RetryPolicy,
    fault: Option<FaultInjector>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

/// Runs operations against a transport. Cheap to clone.
#[derive(Clone)]
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    exec: Arc<Executor>,
}

impl OperationQueue {
    /// Creates the queue and spawns its dispatcher. Must be called within a
    /// Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &NetConfig,
        cancel: CancellationToken,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        let exec = Arc::new(Executor {
            transport,
            timeout: config.timeout(),
            retry: config.retry.clone(),
            fault: config.fault.as_ref().map(FaultInjector::from_config),
            cancel,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, exec.clone()));
        Self { tx, exec }
    }

    /// Exchanges holding a connection slot right now.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.exec.max_connections - self.exec.semaphore.available_permits()
    }

    /// Queues `operation`; `done` receives its terminal outcome.
    #[cfg(test)]
    fn submit(&self, operation: Operation, done: impl FnOnce(Outcome) + Send + 'static) {
        self.enqueue(operation, Box::new(done));
    }

    /// Queues `operation` after `delay`. A cancellation cuts the wait short;
    /// the operation is still dispatched and ends as cancelled.
    pub fn submit_after(
        &self,
        operation: Operation,
        delay: Duration,
        done: impl FnOnce(Outcome) + Send + 'static,
    ) {
        self.enqueue_after(operation, delay, Box::new(done));
    }

    fn enqueue(&self, operation: Operation, done: Done) {
        let job = Job {
            operation,
            done,
            queue: self.clone(),
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            // Dispatcher gone (runtime shutting down): still complete once.
            let error = NetError::cancelled("operation queue closed");
            (job.done)(Err(Failed {
                operation: job.operation,
                error,
            }));
        }
    }

    fn enqueue_after(&self, operation: Operation, delay: Duration, done: Done) {
        if delay.is_zero() {
            self.enqueue(operation, done);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = queue.exec.cancel.cancelled() => {}
            }
            queue.enqueue(operation, done);
        });
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Job>, exec: Arc<Executor>) {
    while let Some(job) = rx.recv().await {
        // After cancellation, jobs run without a slot and end as cancelled.
        let permit = tokio::select! {
            biased;
            _ = exec.cancel.cancelled() => None,
            permit = exec.semaphore.clone().acquire_owned() => permit.ok(),
        };
        tokio::spawn(run(job, permit));
    }
    debug!("operation queue closed");
}

async fn run(job: Job, permit: Option<OwnedSemaphorePermit>) {
    let Job {
        operation,
        done,
        queue,
    } = job;
    let exec = &queue.exec;

    let outcome = {
        let env = Exchange {
            transport: exec.transport.as_ref(),
            timeout: exec.timeout,
            cancel: &exec.cancel,
            fault: exec.fault.as_ref(),
        };
        operation.perform(&env).await
    };
    drop(permit);

    match outcome {
        Err(failed) if failed.error.is_retryable() && !exec.cancel.is_cancelled() => {
            match failed.operation.retried() {
                Some(next) => {
                    let delay = exec.retry.delay_for_attempt(next.tries());
                    warn!(
                        op = next.id(),
                        url = %next.url(),
                        code = %failed.error.code(),
                        attempt = next.tries() + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    queue.enqueue_after(next, delay, done);
                }
                None => {
                    warn!(
                        op = failed.operation.id(),
                        tries = failed.operation.tries(),
                        code = %failed.error.code(),
                        "retries exhausted"
                    );
                    done(Err(failed));
                }
            }
        }
        outcome => done(outcome),
    }
}
