//! In-memory MCP servers for tests.
//!
//! `FakeLauncher` hands out duplex streams instead of OS pipes and runs a
//! scripted server on the other end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Notify;

use super::errors::McpError;
use super::launcher::{LaunchSpec, LaunchedProcess, ProcessHandle, ProcessLauncher};

/// Process handle that records kill signals.
#[derive(Clone, Default)]
pub struct FakeHandle {
    kills: Arc<AtomicUsize>,
    signal: Arc<Notify>,
}

impl FakeHandle {
    pub fn was_killed(&self) -> bool {
        self.kill_count() > 0
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for FakeHandle {
    fn terminate(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.signal.notify_one();
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// A launched "process" whose other end is returned to the test.
pub fn duplex_process() -> (LaunchedProcess, DuplexStream, FakeHandle) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(client);
    let handle = FakeHandle::default();
    let launched = LaunchedProcess {
        stdin: Box::new(write),
        stdout: Box::new(read),
        stderr: None,
        handle: Box::new(handle.clone()),
    };
    (launched, server, handle)
}

/// Scripted MCP server behaviour.
#[derive(Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
    /// Answer `resources/list` and `prompts/list` with method-not-found.
    pub tools_only: bool,
    /// Answer `initialize` with a JSON-RPC error.
    pub reject_initialize: bool,
    /// Never answer anything.
    pub silent: bool,
    /// Stop answering `ping` while set.
    pub ping_hangs: Arc<AtomicBool>,
    /// Canned `tools/call` results by tool name.
    pub tool_results: HashMap<String, Value>,
    /// Every request received, in arrival order.
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names
                .iter()
                .map(|n| json!({"name": n, "description": format!("{n} tool"), "inputSchema": {"type": "object"}}))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris
            .iter()
            .map(|u| json!({"uri": u, "name": u, "mimeType": "text/plain"}))
            .collect();
        self
    }

    pub fn with_prompts(mut self, names: &[&str]) -> Self {
        self.prompts = names
            .iter()
            .map(|n| json!({"name": n, "arguments": [{"name": "topic", "required": true}]}))
            .collect();
        self
    }

    /// Requests received with the given method.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .map(|r| r.iter().filter(|m| m["method"] == method).cloned().collect())
            .unwrap_or_default()
    }

    async fn serve(self, server_id: String, io: DuplexStream, killed: Arc<Notify>) {
        let (read, mut write) = tokio::io::split(io);
        let mut lines = BufReader::new(read).lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = killed.notified() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    _ => break,
                },
            };
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if let Ok(mut received) = self.received.lock() {
                received.push(request.clone());
            }
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            if self.silent {
                continue;
            }
            let Some(reply) = self.answer(&server_id, &request) else {
                continue;
            };
            let mut envelope = json!({"jsonrpc": "2.0", "id": id});
            match reply {
                Ok(result) => envelope["result"] = result,
                Err((code, message)) => {
                    envelope["error"] = json!({"code": code, "message": message})
                }
            }
            let out = format!("{envelope}\n");
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    fn answer(&self, server_id: &str, request: &Value) -> Option<Result<Value, (i32, String)>> {
        let params = &request["params"];
        let method_not_found = || Err((-32601, "Method not found".to_string()));
        let reply = match request["method"].as_str().unwrap_or_default() {
            "initialize" if self.reject_initialize => Err((-32603, "boom".to_string())),
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": server_id, "version": "0.0.1"}
            })),
            "tools/list" => Ok(json!({"tools": self.tools})),
            "resources/list" if self.tools_only => method_not_found(),
            "resources/list" => Ok(json!({"resources": self.resources})),
            "prompts/list" if self.tools_only => method_not_found(),
            "prompts/list" => Ok(json!({"prompts": self.prompts})),
            "ping" if self.ping_hangs.load(Ordering::SeqCst) => return None,
            "ping" => Ok(json!({})),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                Ok(self.tool_results.get(name).cloned().unwrap_or_else(|| {
                    json!({"content": [{"type": "text", "text": format!("{name} on {server_id}")}]})
                }))
            }
            "resources/read" => Ok(json!({
                "contents": [{"uri": params["uri"], "text": format!("read from {server_id}")}]
            })),
            "prompts/get" => Ok(json!({
                "description": params["name"],
                "messages": [{"role": "user", "content": {"type": "text", "text": server_id}}]
            })),
            _ => method_not_found(),
        };
        Some(reply)
    }
}

/// Launcher that connects each server id to its scripted `FakeServer`.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    servers: Arc<Mutex<HashMap<String, FakeServer>>>,
    handles: Arc<Mutex<HashMap<String, FakeHandle>>>,
    launches: Arc<Mutex<Vec<LaunchSpec>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, server_id: &str, server: FakeServer) -> &Self {
        if let Ok(mut servers) = self.servers.lock() {
            servers.insert(server_id.to_string(), server);
        }
        self
    }

    /// Handle of the most recent launch for `server_id`.
    pub fn handle(&self, server_id: &str) -> Option<FakeHandle> {
        self.handles.lock().ok()?.get(server_id).cloned()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, McpError> {
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(spec.clone());
        }
        let server = self
            .servers
            .lock()
            .ok()
            .and_then(|s| s.get(&spec.server_id).cloned())
            .ok_or_else(|| McpError::SpawnFailed {
                server: spec.server_id.clone(),
                reason: format!("{}: No such file or directory", spec.command),
            })?;

        let (launched, server_io, handle) = duplex_process();
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(spec.server_id.clone(), handle.clone());
        }
        tokio::spawn(server.serve(spec.server_id.clone(), server_io, handle.signal.clone()));
        Ok(launched)
    }
}
