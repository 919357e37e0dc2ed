//! Federation service error types.

use thiserror::Error;

/// Errors that can occur while federating MCP servers.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed {
        server: String,
        reason: String,
    },

    /// The initialize handshake or capability discovery failed.
    #[error("server '{server}' initialization failed: {reason}")]
    InitFailed {
        server: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No matching response arrived within the timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The connection was torn down while the request was outstanding.
    #[error("server '{server}' disconnected")]
    Disconnected {
        server: String,
    },

    /// No live connection exists for the server.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// No connected server exposes the resource.
    #[error("resource not found: {uri}")]
    ResourceNotFound {
        uri: String,
    },

    /// No connected server exposes the prompt.
    #[error("prompt not found: {name}")]
    PromptNotFound {
        name: String,
    },

    /// Configuration error (bad bootstrap or proxy config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{server}' failed after {attempts} restart attempts")]
    RestartExhausted {
        server: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether the failure came from the remote server rather than the transport.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ServerError { .. })
    }
}
