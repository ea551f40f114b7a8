//! Outstanding client-call registry for one child session.
//!
//! Each HTTP RPC forwarded to a child registers a [`CallWaiter`] keyed by
//! the upstream correlation id before the frame is written, so the stdout
//! reader can never observe a response for an id it does not know about.
//! Correlation ids are drawn from a per-session counter starting at
//! [`FIRST_CALL_ID`] — far away from the small ids the child assigns to its
//! own server-initiated requests, which keeps the two id populations
//! visually distinct in logs.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

/// First correlation id handed out for client calls.
pub const FIRST_CALL_ID: u64 = 1_000_000;

/// One outstanding HTTP RPC waiting for the child's response frame.
#[derive(Debug)]
pub struct CallWaiter {
    /// The originating method name; used for post-processing and timeout
    /// diagnostics.
    pub method: String,
    /// Delivers the full response frame to the awaiting RPC handler.
    /// Dropping the sender rejects the waiter (the receiver observes a
    /// closed channel, reported as a transport failure).
    pub tx: oneshot::Sender<Value>,
}

/// The per-session map of outstanding calls.
///
/// Not internally synchronized; the owning session wraps it in its own
/// mutex.
#[derive(Debug, Default)]
pub struct PendingCalls {
    map: HashMap<u64, CallWaiter>,
}

impl PendingCalls {
    /// Register a waiter under `id`. Must happen before the request frame
    /// is written to the child.
    pub fn insert(&mut self, id: u64, method: String, tx: oneshot::Sender<Value>) {
        self.map.insert(id, CallWaiter { method, tx });
    }

    /// Whether `id` belongs to an outstanding client call. The classifier
    /// consults this before treating a frame as a server-initiated request.
    pub fn contains(&self, id: u64) -> bool {
        self.map.contains_key(&id)
    }

    /// Remove and return the waiter for `id`, if any.
    pub fn complete(&mut self, id: u64) -> Option<CallWaiter> {
        self.map.remove(&id)
    }

    /// Drop the waiter for `id` without resolving it (timeout or caller
    /// cancellation).
    pub fn abandon(&mut self, id: u64) {
        self.map.remove(&id);
    }

    /// Reject every outstanding waiter by dropping its sender. Called when
    /// the child exits.
    pub fn fail_all(&mut self) -> usize {
        let n = self.map.len();
        self.map.clear();
        n
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_then_complete_delivers_frame() {
        let mut calls = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel();
        calls.insert(FIRST_CALL_ID, "thread/start".into(), tx);
        assert!(calls.contains(FIRST_CALL_ID));

        let waiter = calls.complete(FIRST_CALL_ID).unwrap();
        assert_eq!(waiter.method, "thread/start");
        waiter.tx.send(json!({"id": FIRST_CALL_ID, "result": {}})).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(calls.is_empty());
    }

    #[test]
    fn complete_unknown_id_is_none() {
        let mut calls = PendingCalls::default();
        assert!(calls.complete(42).is_none());
    }

    #[test]
    fn abandon_removes_without_resolving() {
        let mut calls = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel::<Value>();
        calls.insert(1, "x".into(), tx);
        calls.abandon(1);
        assert!(calls.is_empty());
        // Sender dropped: receiver observes closure, not a value.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fail_all_rejects_every_waiter() {
        let mut calls = PendingCalls::default();
        let (tx1, mut rx1) = oneshot::channel::<Value>();
        let (tx2, mut rx2) = oneshot::channel::<Value>();
        calls.insert(1, "a".into(), tx1);
        calls.insert(2, "b".into(), tx2);

        assert_eq!(calls.fail_all(), 2);
        assert!(calls.is_empty());
        assert!(matches!(
            rx1.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(matches!(
            rx2.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
