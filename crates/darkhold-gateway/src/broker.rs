//! Pending interaction registry.
//!
//! When a child sends a server-initiated request (command approval, file
//! change approval, user-input questionnaire), the classifier registers a
//! [`PendingInteraction`] here and announces it to subscribers. Whichever
//! HTTP client answers first wins the record; everyone else observes a
//! conflict. Records for a child's threads are purged when that child
//! exits — after its call waiters are rejected, so an in-flight RPC reports
//! the transport failure rather than a conflict.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// A server-initiated request awaiting a client's decision.
#[derive(Debug, Clone)]
pub struct PendingInteraction {
    /// The session that issued the request (its reply must go there).
    pub session_id: u64,
    /// The correlation id the child used; echoed back in the reply frame.
    pub upstream_id: u64,
    /// The request method, e.g. `execCommandApproval`.
    pub method: String,
    /// The request params, passed through verbatim.
    pub params: Value,
}

/// Registry of pending interactions keyed by `(thread id, request id)`,
/// where the request id is the string form of the child's correlation id.
#[derive(Debug, Default)]
pub struct InteractionBroker {
    pending: Mutex<HashMap<(String, String), PendingInteraction>>,
}

impl InteractionBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending interaction. A duplicate key overwrites — the
    /// child has reused a correlation id, so the older record is dead.
    pub fn register(
        &self,
        thread_id: &str,
        request_id: &str,
        interaction: PendingInteraction,
    ) {
        self.pending
            .lock()
            .expect("broker mutex poisoned")
            .insert((thread_id.to_string(), request_id.to_string()), interaction);
    }

    /// Atomically remove and return the record for `(thread_id,
    /// request_id)`. The first caller wins; later callers get `None` and
    /// report a conflict.
    pub fn take(&self, thread_id: &str, request_id: &str) -> Option<PendingInteraction> {
        self.pending
            .lock()
            .expect("broker mutex poisoned")
            .remove(&(thread_id.to_string(), request_id.to_string()))
    }

    /// Drop every record owned by `session_id` (the child exited). Returns
    /// the `(thread id, request id)` keys that were purged.
    pub fn purge_session(&self, session_id: u64) -> Vec<(String, String)> {
        let mut pending = self.pending.lock().expect("broker mutex poisoned");
        let keys: Vec<(String, String)> = pending
            .iter()
            .filter(|(_, p)| p.session_id == session_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            pending.remove(key);
        }
        keys
    }

    /// Number of pending interactions.
    pub fn len(&self) -> usize {
        self.pending.lock().expect("broker mutex poisoned").len()
    }

    /// Whether no interactions are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
