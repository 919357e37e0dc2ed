//! Proxy policy and bootstrap server definitions.
//!
//! `ProxyConfig` holds operational policy only (timeouts, intervals,
//! load balancing). It never carries credentials, so it is safe to hand out
//! and serialize. Bootstrap definitions come from a Claude-style JSON
//! document (`mcpServers` map); `ProxyConfig` may be read from YAML.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::registry::ServerDefinition;

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_CAPABILITY_CACHE_TTL_MS: u64 = 60_000;

// ─── ProxyConfig ─────────────────────────────────────────────────────────────

/// How a capability name is resolved when several servers expose it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// First connected server in registry order.
    #[default]
    CapabilityBased,
    /// Rotate among matching servers, per capability name.
    RoundRobin,
    /// Matching server with the lowest average latency.
    LeastLatency,
}

/// Tunable policy for the federation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub load_balancing: LoadBalancingStrategy,
    /// Health-check period in milliseconds. `0` disables the monitor.
    pub health_check_interval: u64,
    /// Per-request timeout in milliseconds.
    pub connection_timeout: u64,
    /// Retry hint for callers, and the restart budget for auto-restart servers.
    pub retry_attempts: u32,
    /// Age in milliseconds after which discovered catalogs are refreshed.
    pub capability_cache_ttl: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancingStrategy::CapabilityBased,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            capability_cache_ttl: DEFAULT_CAPABILITY_CACHE_TTL_MS,
        }
    }
}

impl ProxyConfig {
    pub fn health_check_period(&self) -> Option<Duration> {
        (self.health_check_interval > 0).then(|| Duration::from_millis(self.health_check_interval))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.capability_cache_ttl)
    }

    /// Shallow-merge a partial update. Returns `true` when the health-check
    /// interval changed and the monitor must be re-armed.
    pub fn apply(&mut self, patch: &ProxyConfigPatch) -> bool {
        let previous_interval = self.health_check_interval;

        if let Some(strategy) = patch.load_balancing {
            self.load_balancing = strategy;
        }
        if let Some(interval) = patch.health_check_interval {
            self.health_check_interval = interval;
        }
        if let Some(timeout) = patch.connection_timeout {
            self.connection_timeout = timeout;
        }
        if let Some(attempts) = patch.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(ttl) = patch.capability_cache_ttl {
            self.capability_cache_ttl = ttl;
        }

        previous_interval != self.health_check_interval
    }
}

/// Partial `ProxyConfig` for `update_config`. Absent fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigPatch {
    pub load_balancing: Option<LoadBalancingStrategy>,
    pub health_check_interval: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub capability_cache_ttl: Option<u64>,
}

/// Load `ProxyConfig` from a YAML file.
pub fn load_proxy_config(path: &Path) -> Result<ProxyConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    serde_yaml::from_str(&content).map_err(|e| McpError::ConfigError {
        reason: format!("cannot parse {}: {e}", path.display()),
    })
}

/// Load `ProxyConfig`, falling back to defaults when the file is absent or bad.
pub fn load_proxy_config_or_default(path: &Path) -> ProxyConfig {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no proxy config file, using defaults");
        return ProxyConfig::default();
    }
    match load_proxy_config(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded proxy config");
            config
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid proxy config, using defaults");
            ProxyConfig::default()
        }
    }
}

// ─── Bootstrap ───────────────────────────────────────────────────────────────

/// Per-server override of the health-check policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckOverride {
    /// Minimum time between pings for this server.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Ping timeout for this server, replacing `connectionTimeout`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One entry of the bootstrap `mcpServers` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckOverride>,
}

/// Top-level bootstrap document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapConfig {
    #[serde(rename = "mcpServers", alias = "servers", default)]
    pub servers: BTreeMap<String, BootstrapServer>,
}

impl BootstrapConfig {
    /// Server definitions to register, sorted by name, disabled entries dropped.
    pub fn definitions(&self) -> Vec<ServerDefinition> {
        self.servers
            .iter()
            .filter(|(_, server)| !server.disabled)
            .map(|(name, server)| ServerDefinition {
                id: name.clone(),
                name: name.clone(),
                command: server.command.clone(),
                args: server.args.clone(),
                env: server.env.clone(),
                disabled: false,
                auto_restart: server.auto_restart,
                health_check: server.health_check,
            })
            .collect()
    }
}

/// Parse the bootstrap JSON document at `path`.
pub fn load_bootstrap(path: &Path) -> Result<BootstrapConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
        reason: format!("cannot parse {}: {e}", path.display()),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
