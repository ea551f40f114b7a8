//! darkhold — a host-resident HTTP gateway for a local Codex app-server.
//!
//! The gateway spawns `app-server` children, multiplexes client RPCs onto
//! them by thread affinity, persists each thread's event stream to an
//! append-only log, fans events out to SSE subscribers with
//! `Last-Event-ID` resume, and brokers the child's interactive
//! approval/questionnaire requests to whichever HTTP client answers first.
//!
//! Module map:
//!
//! - [`transport`] — child process spawn + stdio handles (trait seam).
//! - [`session`] / [`calls`] — one child and its outstanding RPCs.
//! - [`supervisor`] — frame classification, routing, lifecycle.
//! - [`affinity`] — thread-to-child ownership.
//! - [`hub`] — per-thread publish chain and subscriber fan-out.
//! - [`broker`] — pending interaction registry.
//! - [`http`] — the axum surface; [`allowlist`], [`fs_browser`] support it.
//! - [`cli`] / [`config`] — flags and validated configuration.

pub mod affinity;
pub mod allowlist;
pub mod broker;
pub mod calls;
pub mod cli;
pub mod config;
pub mod error;
pub mod fs_browser;
pub mod http;
pub mod hub;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use error::GatewayError;
