//! The HTTP/SSE surface.
//!
//! Thin adapters between HTTP and the gateway's internals: every handler
//! validates its inputs, delegates to the supervisor / hub / filesystem
//! browser, and maps failures through [`GatewayError`]. The allow-list is
//! enforced as middleware on every route using the peer address from
//! `ConnectInfo`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::allowlist::ClientAllowList;
use crate::error::GatewayError;
use crate::fs_browser;
use crate::hub::EventHub;
use crate::supervisor::Supervisor;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// The multiplexing core.
    pub supervisor: Arc<Supervisor>,
    /// The fan-out hub (shared with the supervisor).
    pub hub: Arc<EventHub>,
    /// Client IP filter.
    pub allowlist: Arc<ClientAllowList>,
    /// Filesystem browser confinement root.
    pub base_path: PathBuf,
    /// SSE keepalive interval.
    pub keepalive: Duration,
}

/// Build the API router with tracing, CORS, and the allow-list applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/fs/list", get(fs_list))
        .route("/api/rpc", post(rpc))
        .route("/api/thread/events", get(thread_events))
        .route("/api/thread/events/stream", get(thread_events_stream))
        .route("/api/thread/interaction/respond", post(interaction_respond))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_allowlist,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn enforce_allowlist(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.allowlist.is_allowed(peer.ip()) {
        next.run(request).await
    } else {
        tracing::debug!(peer = %peer, "rejected client outside allow-list");
        GatewayError::Forbidden.into_response()
    }
}

async fn not_found() -> GatewayError {
    GatewayError::NotFound
}

// ─── /api/health ─────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "basePath": state.base_path.to_string_lossy(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── /api/fs/list ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FsQuery {
    path: Option<String>,
}

async fn fs_list(
    State(state): State<AppState>,
    Query(query): Query<FsQuery>,
) -> Result<Json<Value>, GatewayError> {
    let (listed, entries) = fs_browser::list_dir(&state.base_path, query.path.as_deref()).await?;
    Ok(Json(json!({
        "path": listed.to_string_lossy(),
        "entries": entries,
    })))
}

// ─── /api/rpc ────────────────────────────────────────────────────────────────

async fn rpc(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    let method = body
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("missing 'method'".into()))?;
    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = state.supervisor.rpc(method, params).await?;
    Ok(Json(result))
}

// ─── /api/thread/events ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

impl ThreadQuery {
    fn require_thread_id(&self) -> Result<&str, GatewayError> {
        self.thread_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::BadRequest("missing 'threadId'".into()))
    }
}

async fn thread_events(
    State(state): State<AppState>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Value>, GatewayError> {
    let thread_id = query.require_thread_id()?;
    let events = state
        .hub
        .log()
        .read(thread_id)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read event log: {e}")))?;
    Ok(Json(json!({ "threadId": thread_id, "events": events })))
}

// ─── /api/thread/events/stream ───────────────────────────────────────────────

/// Resume position: the `Last-Event-ID` header wins, the `lastEventId`
/// query parameter is the fallback. Values that do not parse as a
/// non-negative integer mean "replay everything".
fn resume_position(headers: &HeaderMap, query: &ThreadQuery) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.last_event_id.clone())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

async fn thread_events_stream(
    State(state): State<AppState>,
    Query(query): Query<ThreadQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let thread_id = query.require_thread_id()?.to_string();
    let last_event_id = resume_position(&headers, &query);

    let subscription = state
        .hub
        .subscribe(&thread_id, last_event_id)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to open event stream: {e}")))?;

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        let sse = Event::default().id(event.id.to_string()).data(event.data);
        Some((Ok::<Event, Infallible>(sse), subscription))
    });

    let sse = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keepalive).text("keepalive"));
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        sse,
    )
        .into_response())
}

// ─── /api/thread/interaction/respond ─────────────────────────────────────────

async fn interaction_respond(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;

    let thread_id = body
        .get("threadId")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("missing 'threadId'".into()))?;
    let request_id = match body.get("requestId") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(GatewayError::BadRequest("missing 'requestId'".into())),
    };
    let result = body.get("result").cloned();
    let error = body.get("error").cloned();

    state
        .supervisor
        .respond_interaction(thread_id, &request_id, result, error)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert("last-event-id", v.parse().unwrap());
        }
        headers
    }

    fn query(last_event_id: Option<&str>) -> ThreadQuery {
        ThreadQuery {
            thread_id: Some("t1".into()),
            last_event_id: last_event_id.map(str::to_string),
        }
    }

    #[test]
    fn header_wins_over_query() {
        let headers = headers_with(Some("7"));
        assert_eq!(resume_position(&headers, &query(Some("3"))), Some(7));
    }

    #[test]
    fn query_is_the_fallback() {
        let headers = headers_with(None);
        assert_eq!(resume_position(&headers, &query(Some("3"))), Some(3));
    }

    #[test]
    fn absent_everywhere_means_full_replay() {
        let headers = headers_with(None);
        assert_eq!(resume_position(&headers, &query(None)), None);
    }

    #[test]
    fn garbage_means_full_replay() {
        let headers = headers_with(Some("not-a-number"));
        assert_eq!(resume_position(&headers, &query(None)), None);
    }

    #[test]
    fn missing_thread_id_is_bad_request() {
        let q = ThreadQuery {
            thread_id: None,
            last_event_id: None,
        };
        assert!(matches!(
            q.require_thread_id().unwrap_err(),
            GatewayError::BadRequest(_)
        ));
    }
}
