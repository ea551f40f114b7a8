//! Per-thread append-only event log.
//!
//! Every thread known to the gateway owns one `.jsonl` file under a common
//! root directory; each line is one event exactly as it was broadcast to
//! subscribers. The file is the durable source of truth for stream resume:
//! a line's 1-based position in the file is its SSE event id.
//!
//! # Locking discipline
//!
//! Writers (appends and rehydrations) must not interleave. Mutual exclusion
//! is per thread, via a lock directory beside the file (`<name>.lock`):
//! directory creation is atomic on every platform we care about, so whoever
//! creates it owns the lock; contenders poll with a small backoff. Reads
//! run lock-free — every append is a single write of one newline-terminated
//! line, so a reader sees a prefix of the eventual file at worst.
//!
//! Rehydration replaces the whole file (write to a temp file, then rename)
//! so a crash mid-rehydrate never leaves a half-written log behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::summarize::summarize_item;

/// Initial delay between lock acquisition attempts.
const LOCK_BACKOFF_MIN: Duration = Duration::from_millis(1);
/// Ceiling for the exponential lock backoff.
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(25);
/// Total time budget for acquiring a thread lock before giving up.
const LOCK_BUDGET: Duration = Duration::from_secs(5);

/// Errors produced by [`ThreadEventLog`] operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// Filesystem I/O failed.
    #[error("event log I/O on {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The per-thread lock could not be acquired within the time budget.
    #[error("timed out acquiring event log lock for thread '{thread_id}'")]
    LockTimeout {
        /// The thread whose lock was contended.
        thread_id: String,
    },
}

impl EventLogError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Replace any character outside `[A-Za-z0-9._-]` with `_`.
///
/// Thread ids are opaque strings chosen by the app-server; this keeps them
/// safe to use as file names.
pub fn sanitize_thread_id(thread_id: &str) -> String {
    thread_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The per-thread append-only file store.
///
/// Cheap to clone conceptually — callers share it behind an `Arc`.
#[derive(Debug)]
pub struct ThreadEventLog {
    root: PathBuf,
}

/// RAII guard for a thread's lock directory.
///
/// Dropping the guard releases the lock. Removal is synchronous; deleting
/// an empty directory does not block meaningfully.
struct ThreadLock {
    path: PathBuf,
}

impl Drop for ThreadLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}

impl ThreadEventLog {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory holding all per-thread files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, thread_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.jsonl", sanitize_thread_id(thread_id)))
    }

    fn lock_path(&self, thread_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.lock", sanitize_thread_id(thread_id)))
    }

    /// Acquire the per-thread writer lock, polling with exponential backoff.
    async fn lock_thread(&self, thread_id: &str) -> Result<ThreadLock, EventLogError> {
        let path = self.lock_path(thread_id);
        let deadline = tokio::time::Instant::now() + LOCK_BUDGET;
        let mut backoff = LOCK_BACKOFF_MIN;

        loop {
            match fs::create_dir(&path).await {
                Ok(()) => return Ok(ThreadLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(EventLogError::LockTimeout {
                            thread_id: thread_id.to_string(),
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Root directory does not exist yet.
                    fs::create_dir_all(&self.root)
                        .await
                        .map_err(|e| EventLogError::io(&self.root, e))?;
                }
                Err(e) => return Err(EventLogError::io(&path, e)),
            }
        }
    }

    /// Append one event line to the thread's log.
    ///
    /// `line` must be a single JSON value without embedded newlines; the
    /// store adds the terminating `\n`.
    ///
    /// # Errors
    ///
    /// [`EventLogError::LockTimeout`] when the thread lock stays contended
    /// past its budget, [`EventLogError::Io`] on filesystem failure.
    pub async fn append(&self, thread_id: &str, line: &str) -> Result<(), EventLogError> {
        let _lock = self.lock_thread(thread_id).await?;
        let path = self.file_path(thread_id);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EventLogError::io(&path, e))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)
            .await
            .map_err(|e| EventLogError::io(&path, e))?;
        file.flush()
            .await
            .map_err(|e| EventLogError::io(&path, e))?;
        Ok(())
    }

    /// Read all non-empty lines of the thread's log in insertion order.
    ///
    /// A missing file is an empty log, not an error.
    pub async fn read(&self, thread_id: &str) -> Result<Vec<String>, EventLogError> {
        let path = self.file_path(thread_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::io(&path, e)),
        };
        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Number of entries currently in the thread's log.
    pub async fn len(&self, thread_id: &str) -> Result<u64, EventLogError> {
        Ok(self.read(thread_id).await?.len() as u64)
    }

    /// Replace the thread's log with envelopes derived from a `thread/read`
    /// (or `thread/resume`) result.
    ///
    /// The file is rebuilt from scratch — stale lines from a previous
    /// process do not survive. Returns the lines that were written.
    pub async fn rehydrate_from_thread_read(
        &self,
        thread_id: &str,
        result: &Value,
    ) -> Result<Vec<String>, EventLogError> {
        let lines = derive_thread_read_lines(thread_id, result);

        let _lock = self.lock_thread(thread_id).await?;
        let path = self.file_path(thread_id);
        let tmp = self
            .root
            .join(format!("{}.jsonl.tmp", sanitize_thread_id(thread_id)));

        let mut contents = String::new();
        for line in &lines {
            contents.push_str(line);
            contents.push('\n');
        }
        fs::write(&tmp, contents.as_bytes())
            .await
            .map_err(|e| EventLogError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| EventLogError::io(&path, e))?;
        Ok(lines)
    }

    /// Remove the root directory and every per-thread file under it.
    pub async fn cleanup(&self) -> Result<(), EventLogError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EventLogError::io(&self.root, e)),
        }
    }
}

/// Derive the synthetic event lines for a `thread/read` result.
///
/// For each turn, in order: one `darkhold/thread-event` envelope per item,
/// a `turn.error` event when the turn failed with an error message, and a
/// closing `turn/completed` envelope carrying the 1-based turn number.
pub fn derive_thread_read_lines(thread_id: &str, result: &Value) -> Vec<String> {
    let Some(turns) = result.pointer("/thread/turns").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for (idx, turn) in turns.iter().enumerate() {
        let turn_number = idx + 1;

        if let Some(items) = turn.get("items").and_then(Value::as_array) {
            for item in items {
                let summary = summarize_item(item);
                lines.push(
                    json!({
                        "method": "darkhold/thread-event",
                        "params": {
                            "threadId": thread_id,
                            "type": summary.event_type,
                            "message": summary.message,
                            "source": "thread/read",
                        }
                    })
                    .to_string(),
                );
            }
        }

        if turn.get("status").and_then(Value::as_str) == Some("failed") {
            if let Some(message) = turn_error_message(turn) {
                lines.push(
                    json!({
                        "method": "darkhold/thread-event",
                        "params": {
                            "threadId": thread_id,
                            "type": "turn.error",
                            "message": message,
                            "source": "thread/read",
                        }
                    })
                    .to_string(),
                );
            }
        }

        lines.push(
            json!({
                "method": "turn/completed",
                "params": {
                    "threadId": thread_id,
                    "source": "thread/read",
                    "turnNumber": turn_number,
                }
            })
            .to_string(),
        );
    }
    lines
}

/// Extract a failed turn's error message, tolerating both the object form
/// (`error: {message}`) and a bare string.
fn turn_error_message(turn: &Value) -> Option<String> {
    match turn.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_log() -> (tempfile::TempDir, ThreadEventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ThreadEventLog::new(dir.path().join("threads"));
        (dir, log)
    }

    // ─── sanitize ────────────────────────────────────────────────────────────

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_thread_id("abc-123_X.y"), "abc-123_X.y");
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_thread_id("a/b\\c:d e"), "a_b_c_d_e");
        assert_eq!(sanitize_thread_id("../../etc/passwd"), ".._.._etc_passwd");
    }

    // ─── append + read ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let (_dir, log) = make_log();
        log.append("t1", r#"{"seq":1}"#).await.unwrap();
        log.append("t1", r#"{"seq":2}"#).await.unwrap();
        log.append("t1", r#"{"seq":3}"#).await.unwrap();

        let lines = log.read("t1").await.unwrap();
        assert_eq!(lines, vec![r#"{"seq":1}"#, r#"{"seq":2}"#, r#"{"seq":3}"#]);
        assert_eq!(log.len("t1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn read_missing_thread_is_empty() {
        let (_dir, log) = make_log();
        assert!(log.read("nothing").await.unwrap().is_empty());
        assert_eq!(log.len("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn threads_are_isolated() {
        let (_dir, log) = make_log();
        log.append("alpha", r#"{"a":1}"#).await.unwrap();
        log.append("beta", r#"{"b":1}"#).await.unwrap();
        assert_eq!(log.read("alpha").await.unwrap().len(), 1);
        assert_eq!(log.read("beta").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let (_dir, log) = make_log();
        let log = std::sync::Arc::new(log);

        let mut handles = Vec::new();
        for task in 0..8u32 {
            let log = std::sync::Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for i in 0..10u32 {
                    log.append("shared", &format!(r#"{{"task":{task},"i":{i}}}"#))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let lines = log.read("shared").await.unwrap();
        assert_eq!(lines.len(), 80);
        // Every line must be intact JSON — no torn writes.
        for line in lines {
            let _: Value = serde_json::from_str(&line).unwrap();
        }
    }

    // ─── locking ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stale_lock_dir_times_out_append() {
        let (_dir, log) = make_log();
        std::fs::create_dir_all(log.root()).unwrap();
        std::fs::create_dir(log.root().join("held.lock")).unwrap();

        tokio::time::pause();
        let append = tokio::spawn({
            let root = log.root().to_path_buf();
            async move {
                ThreadEventLog::new(root).append("held", "{}").await
            }
        });
        tokio::time::advance(LOCK_BUDGET + Duration::from_secs(1)).await;
        let result = append.await.unwrap();
        assert!(matches!(result, Err(EventLogError::LockTimeout { .. })));
    }

    // ─── rehydration ─────────────────────────────────────────────────────────

    fn two_turn_result() -> Value {
        json!({
            "thread": {
                "id": "t1",
                "turns": [
                    {
                        "items": [
                            {"type": "userMessage", "content": [{"type": "text", "text": "hi"}]},
                            {"type": "agentMessage", "text": "hello"}
                        ],
                        "status": "completed"
                    },
                    {
                        "items": [
                            {"type": "commandExecution", "command": "make", "status": "failed"}
                        ],
                        "status": "failed",
                        "error": {"message": "make exited 2"}
                    }
                ]
            }
        })
    }

    #[test]
    fn derive_lines_covers_items_errors_and_turn_markers() {
        let lines = derive_thread_read_lines("t1", &two_turn_result());
        assert_eq!(lines.len(), 6);

        let parsed: Vec<Value> = lines
            .iter()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed[0]["params"]["type"], "user.input");
        assert_eq!(parsed[0]["params"]["source"], "thread/read");
        assert_eq!(parsed[1]["params"]["type"], "assistant.output");
        assert_eq!(parsed[2]["method"], "turn/completed");
        assert_eq!(parsed[2]["params"]["turnNumber"], 1);
        assert_eq!(parsed[3]["params"]["type"], "command.failed");
        // turn.error comes between the failed turn's items and its marker.
        assert_eq!(parsed[4]["params"]["type"], "turn.error");
        assert_eq!(parsed[5]["method"], "turn/completed");
        assert_eq!(parsed[5]["params"]["turnNumber"], 2);
    }

    #[test]
    fn derive_lines_emits_turn_error_for_failed_turn() {
        let lines = derive_thread_read_lines("t1", &two_turn_result());
        let joined = lines.join("\n");
        assert!(joined.contains("turn.error"));
        assert!(joined.contains("make exited 2"));
    }

    #[test]
    fn derive_lines_without_turns_is_empty() {
        assert!(derive_thread_read_lines("t1", &json!({"thread": {"id": "t1"}})).is_empty());
        assert!(derive_thread_read_lines("t1", &json!({})).is_empty());
    }

    #[tokio::test]
    async fn rehydrate_replaces_stale_content() {
        let (_dir, log) = make_log();
        log.append("t1", r#"{"stale":true}"#).await.unwrap();

        let written = log
            .rehydrate_from_thread_read("t1", &two_turn_result())
            .await
            .unwrap();
        let read_back = log.read("t1").await.unwrap();
        assert_eq!(written, read_back);
        assert!(!read_back.iter().any(|l| l.contains("stale")));
    }

    #[tokio::test]
    async fn rehydrate_is_idempotent() {
        let (_dir, log) = make_log();
        let first = log
            .rehydrate_from_thread_read("t1", &two_turn_result())
            .await
            .unwrap();
        let second = log
            .rehydrate_from_thread_read("t1", &two_turn_result())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(log.read("t1").await.unwrap(), second);
    }

    // ─── cleanup ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_removes_root() {
        let (_dir, log) = make_log();
        log.append("t1", "{}").await.unwrap();
        assert!(log.root().exists());
        log.cleanup().await.unwrap();
        assert!(!log.root().exists());
        // Cleaning an already-missing root is fine.
        log.cleanup().await.unwrap();
    }
}
