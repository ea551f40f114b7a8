//! Transport abstraction for app-server child processes.
//!
//! [`AppServerTransport`] is the trait seam between
//! [`crate::supervisor::Supervisor`] and the mechanism that produces a
//! child's I/O. Production code uses [`ProcessTransport`] (spawns
//! `<bin> app-server`); [`MockTransport`] is an in-memory double for tests.
//!
//! The trait covers I/O creation only. The supervisor owns the stdout
//! reader and exit handling because those are coupled to the pending-call
//! tables and the shared gateway state.
//!
//! The wire dialect is newline-delimited JSON in both directions. Writes go
//! through a single shared writer guarded by a mutex so concurrent tasks
//! never interleave partial frames.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

/// Shared, serialized writer to a child's stdin.
pub type SharedStdin = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Raw I/O handles produced by a successful [`AppServerTransport::spawn`].
///
/// Boxed trait objects so non-process transports can provide in-memory
/// implementations without a real child.
pub struct RawChildIo {
    /// Shared stdin writer; the supervisor shares it with interaction
    /// responders so decisions can be written back to the child.
    pub stdin: SharedStdin,
    /// Raw stdout, consumed by the supervisor's reader task.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Raw stderr, forwarded line-by-line to the error sink. `None` for
    /// transports without one.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// The child process handle, retained for force-kill on shutdown.
    /// `None` for transports that do not spawn a real process.
    pub process: Arc<Mutex<Option<Child>>>,
}

/// Abstracts how the gateway obtains a connection to an app-server child.
///
/// Object-safe via [`async_trait`] so the supervisor can hold a
/// `Box<dyn AppServerTransport>`.
///
/// # Errors
///
/// `spawn` returns an error when the child (or equivalent) cannot be
/// started.
#[async_trait]
pub trait AppServerTransport: Send + Sync + std::fmt::Debug {
    /// Start a fresh child and return its raw I/O handles.
    ///
    /// Called once per child session; a transport may be asked to spawn
    /// again after a previous child exits.
    async fn spawn(&self) -> anyhow::Result<RawChildIo>;
}

/// Write one frame to a shared stdin writer, newline-terminated, holding
/// the writer lock for the whole frame so writes never interleave.
///
/// # Errors
///
/// Propagates the underlying I/O error; callers map it to their
/// transport-closed failure.
pub async fn write_frame(stdin: &SharedStdin, frame: &Value) -> io::Result<()> {
    let json = serde_json::to_string(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut writer = stdin.lock().await;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Transport that spawns a real app-server child process.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    bin: String,
}

impl ProcessTransport {
    /// Create a transport that runs `<bin> app-server`.
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl AppServerTransport for ProcessTransport {
    async fn spawn(&self) -> anyhow::Result<RawChildIo> {
        use tokio::process::Command;

        let mut cmd = Command::new(&self.bin);
        cmd.arg("app-server")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn '{} app-server': {e}", self.bin))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdin must be piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout must be piped"))?;
        let stderr = child.stderr.take();

        Ok(RawChildIo {
            stdin: Arc::new(Mutex::new(
                Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            stdout: Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>,
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            process: Arc::new(Mutex::new(Some(child))),
        })
    }
}

// ─── MockTransport ───────────────────────────────────────────────────────────

/// Test-side handle to one mock child produced by [`MockTransport::spawn`].
///
/// The harness scripts the child by receiving the frames the gateway wrote
/// on [`Self::requests`] and injecting stdout lines via [`Self::inject`].
/// Dropping `inject` closes the mock child's stdout, which the supervisor
/// observes as a child exit.
pub struct MockChild {
    /// Frames the gateway wrote to "child stdin", one JSON line each.
    pub requests: mpsc::UnboundedReceiver<String>,
    /// Lines to surface on "child stdout".
    pub inject: mpsc::UnboundedSender<String>,
}

/// In-memory transport double; no process is spawned.
///
/// Each call to `spawn` creates a fresh duplex pair and hands the test a
/// [`MockChild`] over the channel returned by [`MockTransport::new`], so
/// respawn-after-crash flows can be scripted too.
#[derive(Debug)]
pub struct MockTransport {
    children_tx: mpsc::UnboundedSender<MockChild>,
}

impl MockTransport {
    /// Create the transport plus the receiver on which each spawned
    /// [`MockChild`] arrives.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockChild>) {
        let (children_tx, children_rx) = mpsc::unbounded_channel();
        (Self { children_tx }, children_rx)
    }
}

#[async_trait]
impl AppServerTransport for MockTransport {
    async fn spawn(&self) -> anyhow::Result<RawChildIo> {
        let (mut stdout_write, stdout_read) = tokio::io::duplex(65_536);
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<String>();
        let (request_tx, request_rx) = mpsc::unbounded_channel::<String>();

        // Drain injected lines into the duplex "stdout". When the inject
        // sender drops, the write half drops with the task and the reader
        // sees EOF — the mock child has "exited".
        tokio::spawn(async move {
            while let Some(line) = inject_rx.recv().await {
                let bytes = format!("{line}\n");
                if stdout_write.write_all(bytes.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        self.children_tx
            .send(MockChild {
                requests: request_rx,
                inject: inject_tx,
            })
            .map_err(|_| anyhow::anyhow!("mock child receiver dropped"))?;

        Ok(RawChildIo {
            stdin: Arc::new(Mutex::new(
                Box::new(SniffWriter::new(request_tx)) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            stdout: Box::new(stdout_read) as Box<dyn AsyncRead + Send + Unpin>,
            stderr: None,
            process: Arc::new(Mutex::new(None)),
        })
    }
}

/// An [`AsyncWrite`] that accumulates bytes, splits on `\n`, and forwards
/// each complete line to an unbounded channel. Used by [`MockTransport`] to
/// capture the frames the gateway writes to "child stdin".
struct SniffWriter {
    tx: mpsc::UnboundedSender<String>,
    buf: Vec<u8>,
}

impl SniffWriter {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx, buf: Vec::new() }
    }
}

impl AsyncWrite for SniffWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let s = String::from_utf8_lossy(&line).trim().to_string();
            if !s.is_empty() {
                // Best-effort: the test may have dropped the receiver.
                let _ = self.tx.send(s);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn mock_spawn_delivers_a_child_handle() {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let child = children.recv().await.unwrap();
        drop(io);
        drop(child);
    }

    #[tokio::test]
    async fn write_frame_is_newline_terminated_json() {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let mut child = children.recv().await.unwrap();

        write_frame(&io.stdin, &json!({"id": 1, "method": "initialize"}))
            .await
            .unwrap();

        let line = child.requests.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["method"], "initialize");
    }

    #[tokio::test]
    async fn injected_lines_appear_on_stdout() {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let child = children.recv().await.unwrap();

        child.inject.send(r#"{"method":"x"}"#.to_string()).unwrap();

        let mut lines = tokio::io::BufReader::new(io.stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"method":"x"}"#);
    }

    #[tokio::test]
    async fn dropping_inject_closes_stdout() {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let child = children.recv().await.unwrap();
        drop(child.inject);

        let mut lines = tokio::io::BufReader::new(io.stdout).lines();
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_interleave_frames() {
        let (transport, mut children) = MockTransport::new();
        let io = transport.spawn().await.unwrap();
        let mut child = children.recv().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let stdin = Arc::clone(&io.stdin);
            handles.push(tokio::spawn(async move {
                write_frame(&stdin, &json!({"id": i, "pad": "x".repeat(512)}))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            let line = child.requests.recv().await.unwrap();
            let parsed: Value = serde_json::from_str(&line).unwrap();
            seen.push(parsed["id"].as_u64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }
}
