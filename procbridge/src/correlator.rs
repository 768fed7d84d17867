//! Request/response correlation.
//!
//! Callers register an id and wait on a oneshot channel. The dispatch task
//! resolves entries as responses arrive, in whatever order the worker
//! answers. Entries are removed on resolution, failure, or when the waiting
//! side is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::wire::{Envelope, MessageId};

type Reply = Result<Envelope, BridgeError>;

#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<MessageId, oneshot::Sender<Reply>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request. Fails if `id` is already outstanding.
    pub fn register(self: &Arc<Self>, id: MessageId) -> Result<PendingResponse, BridgeError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        tracing::trace!(%id, "Registered pending request");
        Ok(PendingResponse {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand a response to its waiting caller.
    ///
    /// Returns false when nothing is waiting for that id (late, duplicate or
    /// unsolicited response); the response is dropped.
    pub fn resolve(&self, response: Envelope) -> bool {
        let Some((id, tx)) = self.pending.remove(response.id()) else {
            tracing::trace!(id = %response.id(), "Dropping response with no pending request");
            return false;
        };
        if tx.send(Ok(response)).is_err() {
            tracing::debug!(%id, "Caller went away before its response arrived");
        }
        true
    }

    /// Reject one pending request.
    pub fn fail(&self, id: &MessageId, error: BridgeError) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request, building one error per caller.
    pub fn fail_all(&self, error: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<MessageId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if self.fail(&id, error()) {
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(failed, "Rejected pending requests");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }
}

/// Waiting side of a registered request.
///
/// Dropping it unregisters the id, so an abandoned `send` leaves nothing
/// behind in the correlator.
#[derive(Debug)]
pub struct PendingResponse {
    id: MessageId,
    rx: oneshot::Receiver<Reply>,
    correlator: Arc<Correlator>,
}

impl PendingResponse {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Wait for the response, optionally bounded by `timeout`.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Envelope, BridgeError> {
        let reply = match timeout {
            Some(after) => match tokio::time::timeout(after, &mut self.rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::warn!(id = %self.id, ?after, "Request timed out");
                    return Err(BridgeError::Timeout {
                        id: self.id.clone(),
                        after,
                    });
                }
            },
            None => (&mut self.rx).await,
        };
        // Sender dropped without a reply: the correlator itself went away.
        reply.unwrap_or(Err(BridgeError::Stopped))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::EnvelopeBuilder;

    fn response(id: &str, data: &str) -> Envelope {
        let mut builder = EnvelopeBuilder::new(MessageId::from(id));
        builder.set_payload(data);
        builder.finish().unwrap()
    }

    #[tokio::test]
    async fn resolves_out_of_order() {
        let correlator = Correlator::new();
        let a = correlator.register(MessageId::from("a")).unwrap();
        let b = correlator.register(MessageId::from("b")).unwrap();

        assert!(correlator.resolve(response("b", "for b")));
        assert!(correlator.resolve(response("a", "for a")));

        let b = b.wait(None).await.unwrap();
        let a = a.wait(None).await.unwrap();
        assert_eq!(a.data(), Some("for a"));
        assert_eq!(b.data(), Some("for b"));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn unmatched_and_duplicate_responses_are_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(response("ghost", "")));

        let pending = correlator.register(MessageId::from("x")).unwrap();
        assert!(correlator.resolve(response("x", "first")));
        assert!(!correlator.resolve(response("x", "second")));
        assert_eq!(pending.wait(None).await.unwrap().data(), Some("first"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let correlator = Correlator::new();
        let _first = correlator.register(MessageId::from("x")).unwrap();
        let err = correlator.register(MessageId::from("x")).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateId(_)));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn dropping_pending_unregisters() {
        let correlator = Correlator::new();
        let pending = correlator.register(MessageId::from("x")).unwrap();
        assert!(correlator.contains(pending.id()));
        drop(pending);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn timeout_rejects_and_unregisters() {
        let correlator = Correlator::new();
        let pending = correlator.register(MessageId::from("slow")).unwrap();
        let err = pending
            .wait(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn fail_all_rejects_everyone() {
        let correlator = Correlator::new();
        let a = correlator.register(MessageId::from("a")).unwrap();
        let b = correlator.register(MessageId::from("b")).unwrap();

        assert_eq!(correlator.fail_all(|| BridgeError::Stopped), 2);
        assert!(matches!(a.wait(None).await, Err(BridgeError::Stopped)));
        assert!(matches!(b.wait(None).await, Err(BridgeError::Stopped)));
        assert!(correlator.is_empty());
    }
}
