//! Progress reporter that forwards signals over a channel.

use tokio::sync::mpsc;

use portalsync_protocol::{NetError, ProgressReporter};

/// One progress signal.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Phase(String),
    Description(String),
    Pending(u64),
    Done(Option<NetError>),
}

/// Forwards every signal as a [`ProgressEvent`].
///
/// Sends never block; if the receiver is gone, signals are dropped.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn phase(&self, text: &str) {
        let _ = self.tx.send(ProgressEvent::Phase(text.to_string()));
    }

    fn description(&self, text: &str) {
        let _ = self.tx.send(ProgressEvent::Description(text.to_string()));
    }

    fn pending(&self, count: u64) {
        let _ = self.tx.send(ProgressEvent::Pending(count));
    }

    fn done(&self, error: Option<&NetError>) {
        let _ = self.tx.send(ProgressEvent::Done(error.cloned()));
    }
}
