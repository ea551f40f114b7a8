//! A single running app-server child session.
//!
//! [`ChildSession`] owns everything the gateway knows about one child: the
//! serialized stdin writer, the outstanding-call map, the correlation-id
//! counter, the set of thread ids routed to it, its initialize state, and
//! the process handle kept for force-kill. The supervisor owns the stdout
//! reader task and calls back into the session when frames arrive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex, OnceCell};

use crate::calls::{CallWaiter, PendingCalls, FIRST_CALL_ID};
use crate::error::GatewayError;
use crate::transport::{write_frame, SharedStdin};

/// One running child and its in-flight state.
pub struct ChildSession {
    id: u64,
    stdin: SharedStdin,
    /// Guarded by a plain mutex: map operations never hold it across an
    /// await, and synchronous access lets call cancellation clean up from
    /// a `Drop` impl.
    pending: StdMutex<PendingCalls>,
    next_call_id: AtomicU64,
    /// Resolved exactly once with the child's `initialize` result.
    initialized: OnceCell<Value>,
    threads: StdMutex<HashSet<String>>,
    alive: AtomicBool,
    process: Arc<Mutex<Option<Child>>>,
}

/// Removes an abandoned waiter when a call future is dropped before it
/// resolved — timeout, write failure, or the HTTP client going away.
struct WaiterGuard<'a> {
    pending: &'a StdMutex<PendingCalls>,
    id: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending
                .lock()
                .expect("pending mutex poisoned")
                .abandon(self.id);
        }
    }
}

impl std::fmt::Debug for ChildSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSession")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChildSession {
    /// Wrap freshly spawned child I/O into a session record.
    pub fn new(id: u64, stdin: SharedStdin, process: Arc<Mutex<Option<Child>>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            stdin,
            pending: StdMutex::new(PendingCalls::default()),
            next_call_id: AtomicU64::new(FIRST_CALL_ID),
            initialized: OnceCell::new(),
            threads: StdMutex::new(HashSet::new()),
            alive: AtomicBool::new(true),
            process,
        })
    }

    /// Monotonic session id, unique within this server process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the child is still believed to be running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the child as exited. Idempotent; returns whether this call made
    /// the transition.
    pub fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// The one-shot cell tracking the child's `initialize` handshake.
    pub fn initialized(&self) -> &OnceCell<Value> {
        &self.initialized
    }

    /// Record that `thread_id` is routed to this session. Idempotent.
    pub fn bind_thread(&self, thread_id: &str) {
        self.threads
            .lock()
            .expect("thread set mutex poisoned")
            .insert(thread_id.to_string());
    }

    /// When exactly one thread is bound, return it. Used to target
    /// server-initiated requests that omit `params.threadId`.
    pub fn single_thread(&self) -> Option<String> {
        let threads = self.threads.lock().expect("thread set mutex poisoned");
        if threads.len() == 1 {
            threads.iter().next().cloned()
        } else {
            None
        }
    }

    /// Write an arbitrary frame to the child.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TransportClosed`] when the child has exited or the
    /// pipe write fails.
    pub async fn send(&self, frame: &Value) -> Result<(), GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::TransportClosed);
        }
        write_frame(&self.stdin, frame)
            .await
            .map_err(|_| GatewayError::TransportClosed)
    }

    /// Perform one RPC round-trip: register a waiter, write the request
    /// frame, await the response frame up to `timeout`.
    ///
    /// Returns the child's full response frame (the caller splits
    /// `result` from `error`). If the returned future is dropped before it
    /// resolves — the HTTP client cancelled — the waiter is removed from
    /// the map without touching the child.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::TransportClosed`] — child already exited, the
    ///   write failed, or the child exited while the call was in flight.
    /// - [`GatewayError::RpcTimeout`] — no matching response within
    ///   `timeout`; the waiter is removed from the map.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::TransportClosed);
        }

        let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id, method.to_string(), tx);
        let mut guard = WaiterGuard {
            pending: &self.pending,
            id,
            armed: true,
        };

        let frame = if params.is_null() {
            json!({ "id": id, "method": method })
        } else {
            json!({ "id": id, "method": method, "params": params })
        };
        self.send(&frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                // The classifier already removed the waiter.
                guard.armed = false;
                Ok(response)
            }
            Ok(Err(_)) => {
                // Sender dropped: the child exited and fail_all_calls ran.
                guard.armed = false;
                Err(GatewayError::TransportClosed)
            }
            Err(_) => {
                tracing::warn!(session = self.id, method, "RPC timed out");
                Err(GatewayError::RpcTimeout(method.to_string()))
            }
        }
    }

    /// Whether `id` is an outstanding client call on this session.
    pub fn has_pending(&self, id: u64) -> bool {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .contains(id)
    }

    /// Remove and return the waiter for a response frame's id.
    pub fn take_waiter(&self, id: u64) -> Option<CallWaiter> {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .complete(id)
    }

    /// Reject every outstanding call. Returns how many were rejected.
    pub fn fail_all_calls(&self) -> usize {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .fail_all()
    }

    /// Gracefully stop the child: close its stdin, give it `grace` to exit
    /// on its own, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin signals EOF; a well-behaved child exits promptly.
        {
            let mut stdin = self.stdin.lock().await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut *stdin).await;
        }

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(session = self.id, %status, "app-server exited on its own");
                }
                Ok(Err(e)) => {
                    tracing::warn!(session = self.id, "error waiting for app-server: {e}");
                }
                Err(_) => {
                    tracing::warn!(session = self.id, "app-server ignored stdin EOF, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    /// Collect the child's exit status after its stdout closed. Used by the
    /// supervisor's exit path for diagnostics.
    pub async fn reap(&self) -> Option<std::process::ExitStatus> {
        let child = self.process.lock().await.take();
        match child {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AppServerTransport, MockTransport};

    async fn mock_session() -> (Arc<ChildSession>, crate::transport::MockChild) {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let session = ChildSession::new(1, io.stdin, io.process);
        let child = children.recv().await.unwrap();
        (session, child)
    }

    #[tokio::test]
    async fn call_ids_start_at_one_million_and_increment() {
        let (session, mut child) = mock_session().await;

        // Resolve each call as soon as the request frame shows up.
        let resolver = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                for _ in 0..2 {
                    let line = child.requests.recv().await.unwrap();
                    let frame: Value = serde_json::from_str(&line).unwrap();
                    let id = frame["id"].as_u64().unwrap();
                    let waiter = session.take_waiter(id).unwrap();
                    let _ = waiter.tx.send(json!({"id": id, "result": {"echo": id}}));
                }
            })
        };

        let r1 = session
            .call("a", Value::Null, Duration::from_secs(5))
            .await
            .unwrap();
        let r2 = session
            .call("b", Value::Null, Duration::from_secs(5))
            .await
            .unwrap();
        resolver.await.unwrap();

        assert_eq!(r1["result"]["echo"], FIRST_CALL_ID);
        assert_eq!(r2["result"]["echo"], FIRST_CALL_ID + 1);
    }

    #[tokio::test]
    async fn call_times_out_and_removes_waiter() {
        let (session, _child) = mock_session().await;
        let err = session
            .call("slow/op", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RpcTimeout(m) if m == "slow/op"));
        assert_eq!(session.fail_all_calls(), 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_in_flight_call_as_transport_closed() {
        let (session, mut child) = mock_session().await;

        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .call("turn/start", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        // Wait until the frame is written (waiter registered), then fail.
        let _ = child.requests.recv().await.unwrap();
        session.mark_dead();
        session.fail_all_calls();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::TransportClosed));
    }

    #[tokio::test]
    async fn send_after_death_is_transport_closed() {
        let (session, _child) = mock_session().await;
        session.mark_dead();
        let err = session.send(&json!({"id": 1})).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportClosed));
    }

    #[tokio::test]
    async fn single_thread_only_when_exactly_one_bound() {
        let (session, _child) = mock_session().await;
        assert!(session.single_thread().is_none());
        session.bind_thread("t1");
        assert_eq!(session.single_thread().as_deref(), Some("t1"));
        session.bind_thread("t1"); // idempotent
        assert_eq!(session.single_thread().as_deref(), Some("t1"));
        session.bind_thread("t2");
        assert!(session.single_thread().is_none());
    }

    #[tokio::test]
    async fn mark_dead_reports_transition_once() {
        let (session, _child) = mock_session().await;
        assert!(session.mark_dead(), "first call observes the live->dead edge");
        assert!(!session.mark_dead(), "second call is a no-op");
    }
}
