//! Child supervision and frame routing.
//!
//! The [`Supervisor`] is the multiplexing core: it spawns children through
//! the transport, owns each child's stdout reader, classifies every decoded
//! frame, and wires the result into the right collaborator — the session's
//! call waiters, the interaction broker, or the event hub.
//!
//! # Frame classification
//!
//! For each frame from a child, in order:
//!
//! 1. numeric `id` with `result` or `error` — a response to one of our
//!    calls. Resolve the session's waiter; unmatched responses are dropped.
//! 2. numeric `id` with a string `method` — a server-initiated request
//!    (approval, questionnaire). Register a pending interaction and
//!    announce it on the thread's stream.
//! 3. string `method` without `id` — a notification. When it names a
//!    thread, the raw line is appended to that thread's log and broadcast.
//!
//! Anything else is dropped, as are lines that fail to parse — the child
//! never legitimately emits non-JSON on stdout.
//!
//! # Exit ordering
//!
//! When a child's stdout closes: outstanding waiters are rejected first,
//! pending interactions purged second, affinity cleared last. An in-flight
//! RPC therefore reports the transport failure, never a conflict.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use crate::affinity::ThreadAffinity;
use crate::broker::{InteractionBroker, PendingInteraction};
use crate::error::GatewayError;
use crate::hub::EventHub;
use crate::session::ChildSession;
use crate::transport::AppServerTransport;

/// Owns every child session and the routing between them and the HTTP
/// surface.
pub struct Supervisor {
    transport: Box<dyn AppServerTransport>,
    sessions: StdMutex<HashMap<u64, Arc<ChildSession>>>,
    next_session_id: AtomicU64,
    /// Serializes child spawning so concurrent RPCs on an empty registry
    /// produce one child, not several.
    spawn_gate: Mutex<()>,
    affinity: ThreadAffinity,
    hub: Arc<EventHub>,
    broker: Arc<InteractionBroker>,
    rpc_timeout: Duration,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor. Children are spawned lazily, on the first RPC
    /// that needs one.
    pub fn new(
        transport: Box<dyn AppServerTransport>,
        hub: Arc<EventHub>,
        broker: Arc<InteractionBroker>,
        rpc_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sessions: StdMutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            spawn_gate: Mutex::new(()),
            affinity: ThreadAffinity::new(),
            hub,
            broker,
            rpc_timeout,
            shutdown_grace,
        })
    }

    /// The event hub shared with the HTTP surface.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The thread affinity map.
    pub fn affinity(&self) -> &ThreadAffinity {
        &self.affinity
    }

    /// Number of registered (live) sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session mutex poisoned").len()
    }

    fn session(&self, id: u64) -> Option<Arc<ChildSession>> {
        self.sessions
            .lock()
            .expect("session mutex poisoned")
            .get(&id)
            .cloned()
    }

    // ─── RPC surface ─────────────────────────────────────────────────────────

    /// Forward one client RPC to the affinity-selected child and return the
    /// child's `result` value.
    ///
    /// Non-`initialize` methods first ensure the session completed its
    /// `initialize` handshake. On success, `thread/start` binds the
    /// returned thread id to the session; `thread/read` and `thread/resume`
    /// additionally rehydrate the thread's event log.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Rpc`] when the child answers with an error object,
    /// [`GatewayError::RpcTimeout`] / [`GatewayError::TransportClosed`] on
    /// deadline or child exit, [`GatewayError::Internal`] when no child
    /// could be spawned.
    pub async fn rpc(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, GatewayError> {
        let hint = params
            .get("threadId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let session = self.select_session(hint.as_deref()).await?;

        if method == "initialize" {
            return self.ensure_initialized(&session).await;
        }
        self.ensure_initialized(&session).await?;

        let frame = session.call(method, params, self.rpc_timeout).await?;
        if let Some(error) = frame.get("error") {
            return Err(GatewayError::Rpc(error_message(error)));
        }
        let result = frame.get("result").cloned().unwrap_or(Value::Null);
        self.post_process(&session, method, &result).await;
        Ok(result)
    }

    /// Run the session's `initialize` handshake exactly once, returning its
    /// result. Concurrent callers wait for the one in flight. The child
    /// answering "already initialized" counts as success.
    async fn ensure_initialized(
        &self,
        session: &Arc<ChildSession>,
    ) -> Result<Value, GatewayError> {
        let value = session
            .initialized()
            .get_or_try_init(|| async {
                let params = json!({
                    "clientInfo": {
                        "name": "darkhold",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                });
                let frame = session.call("initialize", params, self.rpc_timeout).await?;
                if let Some(error) = frame.get("error") {
                    let message = error_message(error);
                    if message.to_ascii_lowercase().contains("already initialized") {
                        return Ok(json!({}));
                    }
                    return Err(GatewayError::Rpc(message));
                }
                Ok(frame.get("result").cloned().unwrap_or(Value::Null))
            })
            .await?;
        Ok(value.clone())
    }

    /// Post-process a successful response: bind thread ids, rehydrate logs.
    async fn post_process(&self, session: &Arc<ChildSession>, method: &str, result: &Value) {
        if !matches!(method, "thread/start" | "thread/read" | "thread/resume") {
            return;
        }
        let Some(thread_id) = result.pointer("/thread/id").and_then(Value::as_str) else {
            return;
        };
        self.bind_thread(thread_id, session);

        if matches!(method, "thread/read" | "thread/resume") {
            match self.hub.rehydrate(thread_id, result).await {
                Ok(lines) => {
                    tracing::debug!(thread = thread_id, lines = lines.len(), "rehydrated event log");
                }
                Err(e) => {
                    tracing::warn!(thread = thread_id, "event log rehydration failed: {e}");
                }
            }
        }
    }

    fn bind_thread(&self, thread_id: &str, session: &Arc<ChildSession>) {
        self.affinity.bind(thread_id, session.id());
        session.bind_thread(thread_id);
    }

    // ─── Session selection ───────────────────────────────────────────────────

    /// Pick the child for an RPC: the hinted thread's owner when it is
    /// still alive, else any live session, else a fresh child.
    pub async fn select_session(
        self: &Arc<Self>,
        thread_hint: Option<&str>,
    ) -> Result<Arc<ChildSession>, GatewayError> {
        if let Some(session) = self.find_live(thread_hint) {
            return Ok(session);
        }
        let _gate = self.spawn_gate.lock().await;
        if let Some(session) = self.find_live(thread_hint) {
            return Ok(session);
        }
        self.spawn_session().await
    }

    fn find_live(&self, thread_hint: Option<&str>) -> Option<Arc<ChildSession>> {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        if let Some(thread_id) = thread_hint {
            if let Some(owner) = self.affinity.lookup(thread_id) {
                if let Some(session) = sessions.get(&owner) {
                    if session.is_alive() {
                        return Some(Arc::clone(session));
                    }
                }
            }
        }
        sessions
            .values()
            .filter(|s| s.is_alive())
            .min_by_key(|s| s.id())
            .cloned()
    }

    async fn spawn_session(self: &Arc<Self>) -> Result<Arc<ChildSession>, GatewayError> {
        let io = self
            .transport
            .spawn()
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to start app-server: {e}")))?;

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = ChildSession::new(id, io.stdin, io.process);
        self.sessions
            .lock()
            .expect("session mutex poisoned")
            .insert(id, Arc::clone(&session));

        if let Some(stderr) = io.stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(session = id, "app-server: {line}");
                }
            });
        }

        let supervisor = Arc::clone(self);
        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            let mut lines = BufReader::new(io.stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                supervisor.handle_frame(&reader_session, &line).await;
            }
            supervisor.handle_exit(&reader_session).await;
        });

        tracing::info!(session = id, "spawned app-server child");
        Ok(session)
    }

    // ─── Frame classification ────────────────────────────────────────────────

    async fn handle_frame(&self, session: &Arc<ChildSession>, line: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(line) else {
            tracing::trace!(session = session.id(), "dropping unparseable frame");
            return;
        };

        if let Some(id) = frame.get("id").and_then(Value::as_u64) {
            if frame.get("result").is_some() || frame.get("error").is_some() {
                match session.take_waiter(id) {
                    Some(waiter) => {
                        let _ = waiter.tx.send(frame);
                    }
                    None => {
                        tracing::debug!(session = session.id(), id, "dropping unmatched response");
                    }
                }
                return;
            }
            if let Some(method) = frame.get("method").and_then(Value::as_str) {
                self.handle_server_request(session, id, method, frame.get("params"))
                    .await;
            }
            return;
        }

        if frame.get("method").and_then(Value::as_str).is_some() {
            if let Some(thread_id) = frame.pointer("/params/threadId").and_then(Value::as_str) {
                let thread_id = thread_id.to_string();
                self.bind_thread(&thread_id, session);
                if let Err(e) = self.hub.publish(&thread_id, line).await {
                    tracing::warn!(thread = %thread_id, "failed to record event: {e}");
                }
            }
        }
    }

    /// Register a server-initiated request and announce it on the thread's
    /// stream. Requests that cannot be routed to a thread are dropped.
    async fn handle_server_request(
        &self,
        session: &Arc<ChildSession>,
        upstream_id: u64,
        method: &str,
        params: Option<&Value>,
    ) {
        let thread_id = params
            .and_then(|p| p.get("threadId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| session.single_thread());
        let Some(thread_id) = thread_id else {
            tracing::debug!(
                session = session.id(),
                method,
                "dropping server request with no target thread"
            );
            return;
        };

        let request_id = upstream_id.to_string();
        let params = params.cloned().unwrap_or(Value::Null);
        self.broker.register(
            &thread_id,
            &request_id,
            PendingInteraction {
                session_id: session.id(),
                upstream_id,
                method: method.to_string(),
                params: params.clone(),
            },
        );

        let envelope = json!({
            "method": "darkhold/interaction/request",
            "params": {
                "threadId": thread_id,
                "requestId": request_id,
                "method": method,
                "params": params,
            }
        });
        if let Err(e) = self.hub.publish(&thread_id, &envelope.to_string()).await {
            tracing::warn!(thread = %thread_id, "failed to announce interaction: {e}");
        }
    }

    // ─── Interaction responses ───────────────────────────────────────────────

    /// Deliver a client's decision for a pending interaction to the owning
    /// child. The first responder wins; the resolution is announced on the
    /// thread's stream before the decision frame reaches the child.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] for an unknown or already-resolved
    /// request, [`GatewayError::Gone`] when the owning session exited.
    pub async fn respond_interaction(
        &self,
        thread_id: &str,
        request_id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), GatewayError> {
        let Some(pending) = self.broker.take(thread_id, request_id) else {
            return Err(GatewayError::Conflict(format!(
                "no pending interaction '{request_id}' for thread '{thread_id}'"
            )));
        };

        let session = self
            .session(pending.session_id)
            .filter(|s| s.is_alive())
            .ok_or_else(|| {
                GatewayError::Gone("the app-server session for this interaction has exited".into())
            })?;

        let envelope = json!({
            "method": "darkhold/interaction/resolved",
            "params": { "threadId": thread_id, "requestId": request_id }
        });
        if let Err(e) = self.hub.publish(thread_id, &envelope.to_string()).await {
            tracing::warn!(thread = thread_id, "failed to announce resolution: {e}");
        }

        let mut frame = serde_json::Map::new();
        frame.insert("id".into(), json!(pending.upstream_id));
        match (result, error) {
            (Some(result), _) => {
                frame.insert("result".into(), result);
            }
            (None, Some(error)) => {
                frame.insert("error".into(), error);
            }
            (None, None) => {
                frame.insert("result".into(), Value::Null);
            }
        }
        session.send(&Value::Object(frame)).await.map_err(|_| {
            GatewayError::Gone("app-server exited before the decision could be delivered".into())
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Bookkeeping after a child's stdout closed: reject waiters, purge its
    /// pending interactions, clear affinity, drop the registration.
    async fn handle_exit(&self, session: &Arc<ChildSession>) {
        session.mark_dead();
        let status = session.reap().await;

        let rejected = session.fail_all_calls();
        let purged = self.broker.purge_session(session.id());
        let unbound = self.affinity.unbind_all(session.id());
        self.sessions
            .lock()
            .expect("session mutex poisoned")
            .remove(&session.id());

        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        tracing::info!(
            session = session.id(),
            status = %status,
            rejected,
            purged = purged.len(),
            unbound = unbound.len(),
            "app-server exited"
        );
    }

    /// Tear down every child: close stdin, wait out the grace period, then
    /// kill stragglers.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ChildSession>> = self
            .sessions
            .lock()
            .expect("session mutex poisoned")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            session.shutdown(self.shutdown_grace).await;
        }
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
