//! Thread-to-session affinity map.
//!
//! A thread's traffic must stay on the child that owns its in-memory state,
//! so the map remembers which session currently serves each thread id. At
//! any time a thread is owned by at most one live session; when that
//! session exits its bindings are cleared and the thread is free to be
//! re-bound (typically after a `thread/resume` on a fresh child).

use std::collections::HashMap;
use std::sync::Mutex;

/// Shared cross-reference from thread id to owning session id.
///
/// All operations are O(1) under one mutex; nothing is awaited while the
/// lock is held.
#[derive(Debug, Default)]
pub struct ThreadAffinity {
    map: Mutex<HashMap<String, u64>>,
}

impl ThreadAffinity {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `thread_id` to `session_id`.
    ///
    /// Idempotent and safe to call on every thread-producing event; a
    /// rebind to a different session overwrites (the previous owner has
    /// necessarily exited or handed the thread off).
    pub fn bind(&self, thread_id: &str, session_id: u64) {
        self.map
            .lock()
            .expect("affinity mutex poisoned")
            .insert(thread_id.to_string(), session_id);
    }

    /// The session currently owning `thread_id`, if any.
    pub fn lookup(&self, thread_id: &str) -> Option<u64> {
        self.map
            .lock()
            .expect("affinity mutex poisoned")
            .get(thread_id)
            .copied()
    }

    /// Clear every binding owned by `session_id` (called on child exit).
    /// Returns the thread ids that were unbound.
    pub fn unbind_all(&self, session_id: u64) -> Vec<String> {
        let mut map = self.map.lock().expect("affinity mutex poisoned");
        let threads: Vec<String> = map
            .iter()
            .filter(|(_, sid)| **sid == session_id)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in &threads {
            map.remove(tid);
        }
        threads
    }

    /// Number of bound threads.
    pub fn len(&self) -> usize {
        self.map.lock().expect("affinity mutex poisoned").len()
    }

    /// Whether no threads are bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
