//! Process-level notifications.
//!
//! Responses travel on per-request channels. Everything that is not tied to a
//! single request (stderr output, unparsable frames, exits) is broadcast here.

use tokio::sync::broadcast;

use crate::supervisor::ExitInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Handshake completed.
    Started { pid: Option<u32> },
    /// One line the worker wrote to stderr.
    Stderr { line: String },
    /// A frame that did not deserialize into an envelope. Dispatch continues.
    ParseError { frame: String, error: String },
    /// Reading from or writing to the worker failed.
    ProcessError { message: String },
    /// The worker exited. `solicited` is true when `stop()` caused it.
    Exited { exit: ExitInfo, solicited: bool },
}

/// Broadcast sender that never fails when nobody is listening.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        // Err only means there are no subscribers.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}
