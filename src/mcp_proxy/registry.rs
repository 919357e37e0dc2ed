//! Server registry: the single source of truth for which servers exist.
//!
//! Holds each server's definition and runtime state (status, discovered
//! catalogs, last error). Process handles live in the transport layer and are
//! never stored here, so snapshots cannot leak them.
//!
//! Every connection attempt gets a fresh generation number. Results of an
//! attempt are only committed while its generation is current, which makes
//! late completions after unregister/re-register harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::HealthCheckOverride;
use super::types::{Capabilities, McpPrompt, McpResource, McpTool};

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to launch one MCP server. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides layered over the service's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckOverride>,
}

impl ServerDefinition {
    /// Minimal definition with `name` equal to `id`.
    pub fn new(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            disabled: false,
            auto_restart: false,
            health_check: None,
        }
    }
}

/// Connection status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Read-only copy of a server's state for callers outside the service.
///
/// Environment values are omitted (they may hold tokens); only the keys are
/// reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub id: String,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env_keys: Vec<String>,
    pub disabled: bool,
    pub auto_restart: bool,
    pub status: ServerStatus,
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

// ─── Internal State ──────────────────────────────────────────────────────────

struct ServerEntry {
    definition: ServerDefinition,
    status: ServerStatus,
    capabilities: Capabilities,
    last_error: Option<String>,
    generation: u64,
    discovered_at: Option<Instant>,
    connected_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    last_ping: Option<Instant>,
}

impl ServerEntry {
    fn new(definition: ServerDefinition, generation: u64) -> Self {
        Self {
            definition,
            status: ServerStatus::Disconnected,
            capabilities: Capabilities::default(),
            last_error: None,
            generation,
            discovered_at: None,
            connected_at: None,
            last_health_check: None,
            last_ping: None,
        }
    }

    fn snapshot(&self) -> ServerSnapshot {
        let def = &self.definition;
        let mut env_keys: Vec<String> = def.env.keys().cloned().collect();
        env_keys.sort();
        ServerSnapshot {
            id: def.id.clone(),
            name: def.name.clone(),
            command: def.command.clone(),
            args: def.args.clone(),
            env_keys,
            disabled: def.disabled,
            auto_restart: def.auto_restart,
            status: self.status,
            tools: self.capabilities.tools.clone(),
            resources: self.capabilities.resources.clone(),
            prompts: self.capabilities.prompts.clone(),
            last_error: self.last_error.clone(),
            connected_at: self.connected_at,
            last_health_check: self.last_health_check,
        }
    }

    fn is_connected(&self) -> bool {
        self.status == ServerStatus::Connected
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Ordered table of registered servers. Iteration follows registration order.
#[derive(Default)]
pub struct ServerRegistry {
    entries: RwLock<Vec<ServerEntry>>,
    next_generation: AtomicU64,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ServerEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ServerEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a definition with fresh runtime state.
    ///
    /// A duplicate id overwrites the old entry in place (keeping its position).
    /// Returns `true` when an entry was replaced.
    pub fn register(&self, definition: ServerDefinition) -> bool {
        let entry = ServerEntry::new(definition, self.generation());
        let mut entries = self.write();
        match entries.iter_mut().find(|e| e.definition.id == entry.definition.id) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                entries.push(entry);
                false
            }
        }
    }

    /// Remove a server. Returns `false` for unknown ids.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|e| e.definition.id != id);
        entries.len() != before
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|e| e.definition.id.clone()).collect()
    }

    pub fn definition(&self, id: &str) -> Option<ServerDefinition> {
        self.read()
            .iter()
            .find(|e| e.definition.id == id)
            .map(|e| e.definition.clone())
    }

    pub fn status(&self, id: &str) -> Option<ServerStatus> {
        self.read()
            .iter()
            .find(|e| e.definition.id == id)
            .map(|e| e.status)
    }

    pub fn snapshot(&self, id: &str) -> Option<ServerSnapshot> {
        self.read()
            .iter()
            .find(|e| e.definition.id == id)
            .map(ServerEntry::snapshot)
    }

    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.read().iter().map(ServerEntry::snapshot).collect()
    }

    // ─── Status Transitions ──────────────────────────────────────────────

    /// Start a connection attempt: `* → connecting`. Returns the attempt's
    /// generation, or `None` for unknown ids.
    pub fn begin_connect(&self, id: &str) -> Option<u64> {
        let generation = self.generation();
        let mut entries = self.write();
        let entry = entries.iter_mut().find(|e| e.definition.id == id)?;
        entry.status = ServerStatus::Connecting;
        entry.last_error = None;
        entry.generation = generation;
        Some(generation)
    }

    /// `connecting → connected` with the discovered catalogs.
    ///
    /// Returns `false` if the attempt is stale (server removed, re-registered,
    /// or a newer attempt started), in which case nothing changes.
    pub fn finish_connect(&self, id: &str, generation: u64, capabilities: Capabilities) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.definition.id == id && e.generation == generation)
        else {
            return false;
        };
        if entry.status != ServerStatus::Connecting {
            return false;
        }
        entry.status = ServerStatus::Connected;
        entry.capabilities = capabilities;
        entry.discovered_at = Some(Instant::now());
        entry.connected_at = Some(Utc::now());
        entry.last_ping = None;
        true
    }

    /// `connecting → error` for a failed attempt. Stale attempts are ignored.
    pub fn fail_connect(&self, id: &str, generation: u64, error: &str) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.definition.id == id && e.generation == generation)
        else {
            return false;
        };
        entry.status = ServerStatus::Error;
        entry.last_error = Some(error.to_string());
        true
    }

    /// `connected → error` after a failed health check.
    ///
    /// Only a currently connected server is demoted, so one outage yields
    /// exactly one transition.
    pub fn mark_unhealthy(&self, id: &str, generation: u64, error: &str) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.definition.id == id && e.generation == generation)
        else {
            return false;
        };
        if !entry.is_connected() {
            return false;
        }
        entry.status = ServerStatus::Error;
        entry.last_error = Some(error.to_string());
        true
    }

    /// Explicit disconnect: any status → `disconnected`.
    pub fn mark_disconnected(&self, id: &str) -> bool {
        let generation = self.generation();
        let mut entries = self.write();
        let Some(entry) = entries.iter_mut().find(|e| e.definition.id == id) else {
            return false;
        };
        entry.status = ServerStatus::Disconnected;
        entry.generation = generation;
        entry.connected_at = None;
        true
    }

    /// Replace the catalogs of a connected server (cache refresh).
    pub fn refresh_capabilities(&self, id: &str, generation: u64, capabilities: Capabilities) -> bool {
        let mut entries = self.write();
        match entries
            .iter_mut()
            .find(|e| e.definition.id == id && e.generation == generation && e.is_connected())
        {
            Some(entry) => {
                entry.capabilities = capabilities;
                entry.discovered_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    // ─── Health Bookkeeping ──────────────────────────────────────────────

    /// Connected servers whose ping is due, with their attempt generation and
    /// ping timeout.
    pub fn due_for_ping(&self, now: Instant, default_timeout: Duration) -> Vec<(String, u64, Duration)> {
        self.read()
            .iter()
            .filter(|e| e.is_connected())
            .filter(|e| {
                let interval = e
                    .definition
                    .health_check
                    .and_then(|h| h.interval_ms)
                    .map(Duration::from_millis);
                match (interval, e.last_ping) {
                    (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
                    _ => true,
                }
            })
            .map(|e| {
                let timeout = e
                    .definition
                    .health_check
                    .and_then(|h| h.timeout_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout);
                (e.definition.id.clone(), e.generation, timeout)
            })
            .collect()
    }

    pub fn record_ping(&self, id: &str, at: Instant) {
        if let Some(entry) = self.write().iter_mut().find(|e| e.definition.id == id) {
            entry.last_ping = Some(at);
            entry.last_health_check = Some(Utc::now());
        }
    }

    /// Whether a connected server's catalogs are older than `ttl`.
    pub fn capabilities_stale(&self, id: &str, ttl: Duration) -> bool {
        self.read()
            .iter()
            .find(|e| e.definition.id == id && e.is_connected())
            .and_then(|e| e.discovered_at)
            .is_some_and(|at| at.elapsed() >= ttl)
    }

    // ─── Aggregation ─────────────────────────────────────────────────────

    /// Tools of every connected server, in registry order.
    pub fn connected_tools(&self) -> Vec<McpTool> {
        self.read()
            .iter()
            .filter(|e| e.is_connected())
            .flat_map(|e| e.capabilities.tools.iter().cloned())
            .collect()
    }

    pub fn connected_resources(&self) -> Vec<McpResource> {
        self.read()
            .iter()
            .filter(|e| e.is_connected())
            .flat_map(|e| e.capabilities.resources.iter().cloned())
            .collect()
    }

    pub fn connected_prompts(&self) -> Vec<McpPrompt> {
        self.read()
            .iter()
            .filter(|e| e.is_connected())
            .flat_map(|e| e.capabilities.prompts.iter().cloned())
            .collect()
    }

    /// Connected servers, in registry order, whose catalogs satisfy `has`.
    pub fn connected_owners(&self, has: impl Fn(&Capabilities) -> bool) -> Vec<String> {
        self.read()
            .iter()
            .filter(|e| e.is_connected() && has(&e.capabilities))
            .map(|e| e.definition.id.clone())
            .collect()
    }

    /// Force a server's state without a connection. Test-only.
    #[cfg(test)]
    pub(crate) fn force_state(&self, id: &str, status: ServerStatus, capabilities: Capabilities) {
        if let Some(entry) = self.write().iter_mut().find(|e| e.definition.id == id) {
            entry.status = status;
            entry.capabilities = capabilities;
            entry.discovered_at = Some(Instant::now());
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
