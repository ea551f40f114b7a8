//! Shared building blocks for the darkhold gateway.
//!
//! This crate is deliberately light on dependencies. It hosts the pieces
//! that are useful both to the gateway binary and to tooling around it:
//!
//! - [`logging`] — process-level tracing initialization.
//! - [`event_log`] — the per-thread append-only JSONL store with
//!   cross-task locking and rehydration from `thread/read` results.
//! - [`summarize`] — the item-to-event mapping shared by the rehydration
//!   path and by clients rendering live items.

pub mod event_log;
pub mod logging;
pub mod summarize;

pub use event_log::{EventLogError, ThreadEventLog};
pub use summarize::{summarize_item, ItemSummary};
