//! JSON-RPC over stdio transport.
//!
//! One transport per live server connection:
//! - Requests are written as one JSON object per line to the child's stdin
//! - A background reader task parses stdout lines and completes the pending
//!   request whose id matches, so responses may arrive in any order
//! - Lines that are not a response to an outstanding request are published
//!   as `server:message` events

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::events::{EventBus, ProxyEvent};
use super::launcher::{BoxedReader, BoxedWriter, LaunchedProcess, ProcessHandle};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

type PendingSender = oneshot::Sender<Result<JsonRpcResponse, McpError>>;
type PendingMap = Arc<Mutex<HashMap<u64, PendingSender>>>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_id: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Take ownership of a launched process and start reading its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(server_id: &str, launched: LaunchedProcess, events: EventBus) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let mut tasks = vec![tokio::spawn(read_loop(
            server_id.to_string(),
            launched.stdout,
            pending.clone(),
            closed.clone(),
            events,
        ))];
        if let Some(stderr) = launched.stderr {
            tasks.push(tokio::spawn(drain_stderr(server_id.to_string(), stderr)));
        }

        Self {
            server_id: server_id.to_string(),
            writer: tokio::sync::Mutex::new(launched.stdin),
            pending,
            closed,
            process: Mutex::new(Some(launched.handle)),
            tasks,
        }
    }

    /// Whether the transport has been closed or the server's stdout ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    ///
    /// On timeout the pending entry is removed, so a late response is
    /// reported as an unsolicited message instead.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(McpError::Disconnected {
                server: self.server_id.clone(),
            });
        }

        let id = next_request_id();
        let line = self.encode(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::Disconnected {
                server: self.server_id.clone(),
            }),
            Err(_) => {
                self.forget(id);
                tracing::warn!(
                    server = %self.server_id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    server: self.server_id.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Disconnected {
                server: self.server_id.clone(),
            });
        }
        let line = self.encode(&JsonRpcNotification::new(method, params))?;
        self.write_line(&line).await
    }

    /// Kill the process and reject every outstanding request. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        reject_all(&self.pending, || McpError::Disconnected {
            server: self.server_id.clone(),
        });
        for task in &self.tasks {
            task.abort();
        }
        let handle = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            tracing::debug!(server = %self.server_id, pid = ?handle.pid(), "terminating server process");
            handle.terminate();
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Reader Tasks ────────────────────────────────────────────────────────────

fn reject_all(pending: &PendingMap, error: impl Fn() -> McpError) {
    let drained: Vec<PendingSender> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in drained {
        let _ = tx.send(Err(error()));
    }
}

async fn read_loop(
    server_id: String,
    stdout: BoxedReader,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    events: EventBus,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    dispatch_line(&server_id, trimmed, &pending, &events);
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::warn!(server = %server_id, reason = %reason, "server output stream ended");
    closed.store(true, Ordering::Release);
    reject_all(&pending, || McpError::TransportError {
        server: server_id.clone(),
        reason: reason.clone(),
    });
}

/// Route one stdout line: complete a pending request or publish it.
fn dispatch_line(server_id: &str, line: &str, pending: &PendingMap, events: &EventBus) {
    let message: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(server = %server_id, error = %e, "non-JSON line from server");
            events.emit(ProxyEvent::Message {
                server_id: server_id.to_string(),
                payload: Value::String(line.to_string()),
            });
            return;
        }
    };

    let response_id = match (message.get("method"), message.get("id").and_then(Value::as_u64)) {
        (None, Some(id)) => Some(id),
        _ => None,
    };

    let sender = response_id.and_then(|id| {
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    });

    match sender {
        Some(tx) => {
            let parsed = serde_json::from_value::<JsonRpcResponse>(message).map_err(|e| {
                McpError::TransportError {
                    server: server_id.to_string(),
                    reason: format!("malformed response: {e}"),
                }
            });
            let _ = tx.send(parsed);
        }
        None => events.emit(ProxyEvent::Message {
            server_id: server_id.to_string(),
            payload: message,
        }),
    }
}

async fn drain_stderr(server_id: String, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server_id, stderr = %line, "server stderr");
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
