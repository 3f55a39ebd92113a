// src/client/pending.rs

//! Pending-request bookkeeping for the client coordinator.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::CorrelationId;

/// Maps in-flight correlation ids to their callers' result slots.
///
/// An entry is created when a request is published and destroyed when a
/// matching response arrives or the wait deadline elapses, whichever comes
/// first. At most one entry exists per correlation id; the map's keyed
/// lookup is the byte-exact matching rule.
pub(crate) struct PendingRequests {
    // ---
    requests: HashMap<CorrelationId, oneshot::Sender<Bytes>>,
}

impl PendingRequests {
    // ---
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }

    /// Register a new pending request, returning the caller's result slot.
    pub fn register(&mut self, correlation_id: CorrelationId) -> oneshot::Receiver<Bytes> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.requests.insert(correlation_id, tx);
        rx
    }

    /// Complete a pending request with the response payload.
    ///
    /// Returns `false` when no request with this id is outstanding, which
    /// is the expected fate of post-timeout stragglers.
    pub fn complete(&mut self, correlation_id: &CorrelationId, response: Bytes) -> bool {
        // ---
        if let Some(tx) = self.requests.remove(correlation_id) {
            // A dropped receiver means the caller abandoned the wait
            // between lookup and send; equally fine.
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    /// Abandon a pending request without delivering a response.
    ///
    /// Called on timeout and publish failure so a late reply finds no
    /// entry and is dropped.
    pub fn abandon(&mut self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.requests.remove(correlation_id).is_some()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn register_and_complete() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::generate();

        let rx = pending.register(id.clone());
        assert_eq!(pending.len(), 1);

        let response = Bytes::from("response");
        assert!(pending.complete(&id, response.clone()));
        assert_eq!(pending.len(), 0);

        assert_eq!(rx.blocking_recv().unwrap(), response);
    }

    #[test]
    fn abandon_removes_entry() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::generate();

        let _rx = pending.register(id.clone());
        assert!(pending.abandon(&id));
        assert!(!pending.abandon(&id));

        // A straggler for the abandoned id is simply not matched.
        assert!(!pending.complete(&id, Bytes::from("late")));
    }

    #[test]
    fn complete_unknown_id_is_dropped() {
        // ---
        let mut pending = PendingRequests::new();
        assert!(!pending.complete(&CorrelationId::generate(), Bytes::from("stray")));
    }
}
