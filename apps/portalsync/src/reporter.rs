//! Progress reporter that logs through `tracing`.

use tracing::{debug, info, warn};

use portalsync_protocol::{NetError, ProgressReporter};

pub struct TracingReporter {
    job: &'static str,
}

impl TracingReporter {
    pub fn new(job: &'static str) -> Self {
        Self { job }
    }
}

impl ProgressReporter for TracingReporter {
    fn phase(&self, text: &str) {
        info!(job = self.job, phase = text, "phase");
    }

    fn description(&self, text: &str) {
        info!(job = self.job, "{text}");
    }

    fn pending(&self, count: u64) {
        debug!(job = self.job, pending = count, "pending operations");
    }

    fn done(&self, error: Option<&NetError>) {
        match error {
            None => info!(job = self.job, "done"),
            Some(e) => warn!(job = self.job, code = %e.code(), error = %e, "done with error"),
        }
    }
}
