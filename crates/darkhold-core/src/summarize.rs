//! Item-to-event summarization.
//!
//! The app-server describes turn contents as heterogeneous "thread items"
//! (user messages, agent messages, command executions, file changes, tool
//! calls). Both the rehydration path in [`crate::event_log`] and UI clients
//! rendering live items reduce an item to a `(type, message)` pair; this
//! module is the single definition of that mapping so the two paths cannot
//! drift apart.
//!
//! Unknown item shapes are preserved rather than dropped: they map to
//! `item.<type>` with the full JSON text as the message.

use serde_json::Value;

/// The `(type, message)` reduction of a single thread item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    /// Dotted event type, e.g. `user.input` or `command.completed`.
    pub event_type: String,
    /// Human-readable one-line summary of the item.
    pub message: String,
}

impl ItemSummary {
    fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
        }
    }
}

/// Reduce a thread item to its `(type, message)` summary.
///
/// The mapping:
///
/// | item shape | type | message |
/// |---|---|---|
/// | `userMessage` with text content | `user.input` | concatenated text segments |
/// | `agentMessage` with `text` | `assistant.output` | the text |
/// | `commandExecution` with `command` | `command.<status>` | the command string |
/// | `fileChange` with `changes` | `file.change` | `<n> file(s) changed` |
/// | `mcpToolCall` with `tool` | `mcp.tool` | `<server>.<tool>` |
/// | anything else | `item.<type>` | full JSON string |
pub fn summarize_item(item: &Value) -> ItemSummary {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("unknown");

    match item_type {
        "userMessage" => {
            if let Some(text) = user_message_text(item) {
                ItemSummary::new("user.input", text)
            } else {
                ItemSummary::new("user.input", "[non-text input]")
            }
        }
        "agentMessage" => match item.get("text").and_then(Value::as_str) {
            Some(text) => ItemSummary::new("assistant.output", text),
            None => fallback(item, item_type),
        },
        "commandExecution" => match item.get("command").and_then(Value::as_str) {
            Some(command) => {
                let status = item
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("updated");
                ItemSummary::new(format!("command.{status}"), command)
            }
            None => fallback(item, item_type),
        },
        "fileChange" => match item.get("changes").and_then(Value::as_array) {
            Some(changes) => ItemSummary::new(
                "file.change",
                format!("{} file(s) changed", changes.len()),
            ),
            None => fallback(item, item_type),
        },
        "mcpToolCall" => match item.get("tool").and_then(Value::as_str) {
            Some(tool) => {
                let server = item.get("server").and_then(Value::as_str).unwrap_or("mcp");
                ItemSummary::new("mcp.tool", format!("{server}.{tool}"))
            }
            None => fallback(item, item_type),
        },
        other => fallback(item, other),
    }
}

/// Concatenate the text segments of a `userMessage`'s content.
///
/// Returns `None` when the item carries no text at all (image-only input,
/// unexpected content shape).
fn user_message_text(item: &Value) -> Option<String> {
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    let segments = item.get("content").and_then(Value::as_array)?;
    let mut out = String::new();
    for segment in segments {
        if let Some(text) = segment.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn fallback(item: &Value, item_type: &str) -> ItemSummary {
    ItemSummary::new(format!("item.{item_type}"), item.to_string())
}
