//! Master-side façade: one worker, many correlated requests.
//!
//! ```ignore
//! let bridge = Bridge::new(BridgeConfig::new("./worker"));
//! let response = bridge
//!     .send(|req| {
//!         req.set_query_field("op", "ping");
//!     })
//!     .await?;
//! assert_eq!(response.data(), Some("pong"));
//! bridge.stop().await;
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::events::BridgeEvent;
use crate::supervisor::{ExitInfo, ProcessState, ProcessSupervisor};
use crate::wire::{Envelope, EnvelopeBuilder, MessageId};

/// Bridge to a single worker subprocess.
///
/// Cheap to clone; clones share the worker and the pending requests.
#[derive(Clone)]
pub struct Bridge {
    supervisor: ProcessSupervisor,
    correlator: Arc<Correlator>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let correlator = Correlator::new();
        Self {
            supervisor: ProcessSupervisor::new(config, Arc::clone(&correlator)),
            correlator,
        }
    }

    /// Spawn the worker if it isn't running. Resolves once the handshake is done.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.supervisor.start().await
    }

    /// Stop the worker. Returns immediately with `None` if it was never started.
    pub async fn stop(&self) -> Option<ExitInfo> {
        self.supervisor.stop().await
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// `build` fills in the request before it is sent. The worker is started
    /// on first use. Responses may arrive in any order; each caller gets the
    /// one matching its own id. A response with an `error` field is still
    /// `Ok`; use [`Envelope::into_result`] to turn it into an error.
    pub async fn send<F>(&self, build: F) -> Result<Envelope, BridgeError>
    where
        F: FnOnce(&mut EnvelopeBuilder),
    {
        let mut builder = EnvelopeBuilder::new(MessageId::new());
        build(&mut builder);
        let request = builder.finish()?;

        let id = request.id().clone();
        let pending = self.correlator.register(id.clone())?;

        // A stop() in progress rejects the entry while we wait for the
        // lifecycle lock; don't bring up a worker for it afterwards.
        let running = self
            .supervisor
            .start_unless(|| !self.correlator.contains(&id))
            .await?;
        if !running || !self.correlator.contains(&id) {
            tracing::debug!(%id, "Request rejected before it was sent");
            return pending.wait(None).await;
        }

        tracing::debug!(%id, "Sending request");
        self.supervisor.send(&request).await?;

        pending.wait(self.supervisor.config().request_timeout).await
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.supervisor.watch_state()
    }

    /// Lifecycle notifications: stderr lines, malformed frames, exits.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.supervisor.subscribe()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.supervisor.pid().await
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn invalid_request_never_spawns() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/worker"));
        let err = bridge
            .send(|req| {
                req.set_query_field("", "x");
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(bridge.state(), ProcessState::NotStarted);
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_nothing_pending() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/worker"));
        let err = bridge.send(|_| {}).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Spawn);
        assert_eq!(bridge.state(), ProcessState::NotStarted);
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_resolves_immediately() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/worker"));
        assert_eq!(bridge.stop().await, None);
        assert_eq!(bridge.pid().await, None);
    }
}
