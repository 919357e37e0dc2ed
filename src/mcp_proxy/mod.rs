//! MCP Proxy: federates many MCP servers behind one service.
//!
//! This module handles:
//! - Spawning MCP server child processes and speaking JSON-RPC 2.0 over stdio
//! - Aggregating tools, resources and prompts across connected servers
//! - Routing calls to the owning server with a pluggable strategy
//! - Periodic health checks with optional auto-restart
//! - Request statistics and a typed event stream for observers
//!
//! `McpProxyService` is the entry point. Everything else is exposed for
//! embedding and tests.

pub mod config;
pub mod errors;
pub mod events;
pub mod health;
pub mod launcher;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod service;
pub mod stats;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{LoadBalancingStrategy, ProxyConfig, ProxyConfigPatch};
pub use errors::McpError;
pub use events::ProxyEvent;
pub use launcher::{ProcessLauncher, TokioProcessLauncher};
pub use registry::{ServerDefinition, ServerSnapshot, ServerStatus};
pub use service::{McpProxyService, ProxyOptions};
pub use stats::{ProxyStats, ServerStats};
pub use types::{McpPrompt, McpResource, McpTool, ToolCallResult};
