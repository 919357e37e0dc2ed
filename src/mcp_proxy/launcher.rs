//! Child-process launching for MCP servers.
//!
//! The connector never touches `tokio::process` directly; it goes through
//! `ProcessLauncher` so the process boundary can be replaced in tests.

use std::collections::HashMap;
use std::ffi::OsString;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::errors::McpError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to start a server, fully resolved before spawn.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    /// Complete child environment: base environment plus overrides.
    /// Inherited values need not be UTF-8.
    pub env: HashMap<OsString, OsString>,
}

/// Live process handle. Owned by the transport, never exposed.
pub trait ProcessHandle: Send {
    /// Send a kill signal without waiting for the process to exit.
    fn terminate(&mut self);

    fn pid(&self) -> Option<u32>;
}

impl ProcessHandle for Child {
    fn terminate(&mut self) {
        if let Err(e) = self.start_kill() {
            tracing::debug!(error = %e, "kill signal not delivered (process may have exited)");
        }
    }

    fn pid(&self) -> Option<u32> {
        self.id()
    }
}

/// A started server: its stdio streams plus the handle that can kill it.
pub struct LaunchedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub handle: Box<dyn ProcessHandle>,
}

/// Starts server processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, McpError>;
}

/// Merge the current process environment with per-server overrides.
///
/// Overrides win. The result is the complete environment of the child.
pub fn resolve_environment(overrides: &HashMap<String, String>) -> HashMap<OsString, OsString> {
    let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();
    env.extend(
        overrides
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}

// ─── TokioProcessLauncher ────────────────────────────────────────────────────

/// Spawns real OS processes with piped stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for TokioProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args).env_clear().envs(&spec.env);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: spec.server_id.clone(),
            reason: format!("{}: {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            server: spec.server_id.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            server: spec.server_id.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::info!(
            server = %spec.server_id,
            command = %spec.command,
            args = ?spec.args,
            pid = ?child.id(),
            "spawned MCP server process"
        );

        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            handle: Box::new(child),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
