//! JSON-RPC over a spawned subprocess's stdio.
//!
//! Handles the subprocess side of a downstream server:
//! - Spawning the process with piped stdin/stdout/stderr
//! - Line-delimited JSON requests on stdin, responses on stdout
//! - A reader task that routes responses and notifications
//! - A drain task that forwards stderr to the log, tagged with the server name

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{
    next_request_id, route_message, NotificationSink, PendingRequests, Transport,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a server gets to exit on its own after stdin closes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for the stderr tail once the server has exited.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer size for the stderr drain.
const STDERR_CHUNK: usize = 4096;

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    /// Optional extra destination for stderr chunks (besides the log).
    diagnostics: Option<mpsc::UnboundedSender<String>>,
    running: Option<Running>,
}

/// Everything owned while the subprocess is alive.
struct Running {
    child: Child,
    writer: Arc<Mutex<ChildStdin>>,
    pending: PendingRequests,
    reader: JoinHandle<()>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Describe a subprocess transport. Nothing is spawned until `start`.
    pub fn new(
        server_name: &str,
        command: &str,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            command: command.to_string(),
            args,
            env,
            diagnostics: None,
            running: None,
        }
    }

    /// Also forward every stderr chunk to `sink`.
    pub fn with_diagnostics(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn running(&self) -> Result<&Running, McpError> {
        self.running
            .as_ref()
            .ok_or_else(|| self.transport_error("transport is not started"))
    }

    async fn write_line(&self, writer: &Mutex<ChildStdin>, json: String) -> Result<(), McpError> {
        write_line(writer, json)
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "ipc"
    }

    async fn start(&mut self, notifications: NotificationSink) -> Result<(), McpError> {
        if self.running.is_some() {
            return Err(self.transport_error("transport already started"));
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::info!(
            server = %self.server_name,
            command = %self.command,
            args = ?self.args,
            "spawning stdio server"
        );

        let mut child = cmd.spawn().map_err(|e| {
            self.transport_error(format!("failed to spawn '{}': {e}", self.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture stdout"))?;

        let stderr_drain = match child.stderr.take() {
            Some(stderr) => Some(tokio::spawn(drain_stderr(
                self.server_name.clone(),
                stderr,
                self.diagnostics.clone(),
            ))),
            None => {
                tracing::warn!(server = %self.server_name, "no stderr available for logging");
                None
            }
        };

        let writer = Arc::new(Mutex::new(stdin));
        let pending = PendingRequests::new();
        let reader = tokio::spawn(read_stdout(
            self.server_name.clone(),
            stdout,
            pending.clone(),
            notifications,
            Arc::clone(&writer),
        ));

        self.running = Some(Running {
            child,
            writer,
            pending,
            reader,
            stderr_drain,
        });
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let running = self.running()?;
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        // Register before writing so a fast reply cannot be missed.
        let (_guard, rx) = running.pending.register(id);
        self.write_line(&running.writer, json).await?;

        rx.await
            .map_err(|_| self.transport_error("server stdout closed (process may have exited)"))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let running = self.running()?;
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        self.write_line(&running.writer, json).await
    }

    async fn close(&mut self) -> Result<(), McpError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        // The reader holds a writer handle for replies; stop it first so
        // dropping ours closes stdin.
        running.reader.abort();
        running.pending.fail_all();
        drop(running.writer);

        let (exited, result) = match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server_name, %status, "stdio server exited");
                (true, Ok(()))
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    "stdio server did not exit after stdin closed, killing"
                );
                let killed = running
                    .child
                    .kill()
                    .await
                    .map_err(|e| self.transport_error(format!("failed to kill process: {e}")));
                (false, killed)
            }
        };

        // After a clean exit the drain ends at EOF once the pipe is empty.
        if let Some(mut drain) = running.stderr_drain {
            let flushed = exited
                && tokio::time::timeout(STDERR_FLUSH_TIMEOUT, &mut drain)
                    .await
                    .is_ok();
            if !flushed {
                drain.abort();
            }
        }
        result
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.reader.abort();
            if let Some(drain) = running.stderr_drain {
                drain.abort();
            }
            // `kill_on_drop` reaps the child.
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn write_line(writer: &Mutex<ChildStdin>, mut json: String) -> std::io::Result<()> {
    json.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await
}

/// Read stdout line by line until the stream closes.
async fn read_stdout(
    server: String,
    stdout: ChildStdout,
    pending: PendingRequests,
    notifications: NotificationSink,
    writer: Arc<Mutex<ChildStdin>>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(reply) = route_message(&server, trimmed, &pending, &notifications) {
                    match serde_json::to_string(&reply) {
                        Ok(json) => {
                            if let Err(e) = write_line(&writer, json).await {
                                tracing::warn!(server = %server, error = %e, "failed to reply to server request");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %server, error = %e, "failed to serialize reply");
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "error reading server stdout");
                break;
            }
        }
    }

    tracing::debug!(server = %server, "server stdout closed");
    pending.fail_all();
}

/// Forward stderr chunks to the log until the stream closes.
///
/// Errors here are logged and swallowed: stderr is diagnostics only.
async fn drain_stderr(
    server: String,
    mut stderr: ChildStderr,
    diagnostics: Option<mpsc::UnboundedSender<String>>,
) {
    let mut buf = vec![0u8; STDERR_CHUNK];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %server, "server stderr closed");
                return;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                tracing::info!(
                    target: "mcp_gate::downstream",
                    server = %server,
                    "{}",
                    chunk.trim_end()
                );
                if let Some(sink) = &diagnostics {
                    let _ = sink.send(chunk.into_owned());
                }
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "error reading server stderr");
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
