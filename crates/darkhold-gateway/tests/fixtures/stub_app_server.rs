//! Scripted app-server used by the integration tests.
//!
//! Speaks the newline-delimited JSON dialect on stdio:
//!
//! - `initialize` — succeeds once; a second call gets the
//!   "already initialized" error a real child produces after a reconnect.
//! - `thread/start` — allocates `t1`, `t2`, ... and echoes the cwd.
//! - `thread/read` — returns a canned two-turn thread (second turn failed)
//!   for whatever `threadId` was asked about.
//! - `turn/start` — emits `turn/started`, then raises an
//!   `execCommandApproval` server request and stalls. When the decision
//!   frame arrives, emits `item/agentMessage/delta` and `turn/completed`
//!   notifications and finally answers the original `turn/start` call.
//! - `test/crash` — exits immediately without answering, mid-call.
//!
//! Plain blocking stdio is plenty here; one frame is handled at a time.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn emit(frame: &Value) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{frame}");
    let _ = lock.flush();
}

fn main() {
    eprintln!("stub app-server ready");

    let mut initialized = false;
    let mut thread_counter = 0u64;
    let mut approval_counter = 0u64;
    // approval id -> (turn/start call id, thread id)
    let mut awaiting_approval: HashMap<u64, (u64, String)> = HashMap::new();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let id = frame.get("id").and_then(Value::as_u64);
        let method = frame.get("method").and_then(Value::as_str);
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        // A frame with an id and no method is a decision for one of our
        // approval requests.
        if method.is_none() {
            if let Some((turn_id, thread_id)) =
                id.and_then(|id| awaiting_approval.remove(&id))
            {
                emit(&json!({
                    "method": "item/agentMessage/delta",
                    "params": {"threadId": thread_id, "delta": "hi"}
                }));
                emit(&json!({
                    "method": "turn/completed",
                    "params": {"threadId": thread_id}
                }));
                emit(&json!({"id": turn_id, "result": {}}));
            }
            continue;
        }

        let Some(id) = id else { continue };
        match method {
            Some("initialize") => {
                if initialized {
                    emit(&json!({
                        "id": id,
                        "error": {"message": "app-server already initialized"}
                    }));
                } else {
                    initialized = true;
                    emit(&json!({"id": id, "result": {"userAgent": "stub"}}));
                }
            }
            Some("thread/start") => {
                thread_counter += 1;
                let cwd = params.get("cwd").and_then(Value::as_str).unwrap_or("/");
                emit(&json!({
                    "id": id,
                    "result": {
                        "thread": {
                            "id": format!("t{thread_counter}"),
                            "cwd": cwd,
                            "updatedAt": 1_700_000_000,
                        }
                    }
                }));
            }
            Some("thread/read") | Some("thread/resume") => {
                let thread_id = params
                    .get("threadId")
                    .and_then(Value::as_str)
                    .unwrap_or("t1");
                emit(&json!({
                    "id": id,
                    "result": {
                        "thread": {
                            "id": thread_id,
                            "cwd": "/tmp",
                            "updatedAt": 1_700_000_000,
                            "turns": [
                                {
                                    "status": "completed",
                                    "items": [
                                        {"type": "userMessage", "content": [{"type": "text", "text": "hi"}]},
                                        {"type": "agentMessage", "text": "hello"}
                                    ]
                                },
                                {
                                    "status": "failed",
                                    "error": {"message": "command exploded"},
                                    "items": [
                                        {"type": "commandExecution", "command": "make", "status": "failed"}
                                    ]
                                }
                            ]
                        }
                    }
                }));
            }
            Some("turn/start") => {
                let thread_id = params
                    .get("threadId")
                    .and_then(Value::as_str)
                    .unwrap_or("t1")
                    .to_string();
                emit(&json!({
                    "method": "turn/started",
                    "params": {"threadId": thread_id}
                }));
                approval_counter += 1;
                awaiting_approval.insert(approval_counter, (id, thread_id.clone()));
                emit(&json!({
                    "id": approval_counter,
                    "method": "execCommandApproval",
                    "params": {"threadId": thread_id, "command": "echo hi"}
                }));
            }
            Some("test/crash") => {
                std::process::exit(1);
            }
            Some(_) => {
                emit(&json!({"id": id, "result": {}}));
            }
            None => unreachable!("handled above"),
        }
    }
}
