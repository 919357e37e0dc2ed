//! Federation service: the public API consumed by the dashboard.
//!
//! `McpProxyService` is a cheap, cloneable handle. Construct one at the
//! composition root and pass it to whatever needs it; there is no global
//! instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::config::{load_bootstrap, ProxyConfig, ProxyConfigPatch};
use super::errors::McpError;
use super::events::{EventBus, ProxyEvent};
use super::health::HealthMonitor;
use super::launcher::{ProcessLauncher, TokioProcessLauncher};
use super::lifecycle::{self, ConnectionTable};
use super::registry::{ServerDefinition, ServerRegistry, ServerSnapshot, ServerStatus};
use super::router::{self, CapabilityKind, Selector};
use super::stats::{ProxyStats, StatsStore};
use super::transport::extract_result;
use super::types::{GetPromptResult, McpPrompt, McpResource, McpTool, ReadResourceResult, ToolCallResult};

/// Construction-time options.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Bootstrap document read by `initialize`. `None` skips bootstrap.
    pub bootstrap_path: Option<PathBuf>,
    /// Initial policy, replaceable by `initialize(Some(..))`.
    pub config: ProxyConfig,
}

/// Shared state behind every `McpProxyService` handle.
pub(crate) struct ProxyInner {
    pub(super) launcher: Arc<dyn ProcessLauncher>,
    pub(super) bootstrap_path: Option<PathBuf>,
    pub(super) registry: ServerRegistry,
    pub(super) connections: ConnectionTable,
    pub(super) stats: StatsStore,
    pub(super) config: RwLock<ProxyConfig>,
    pub(super) selector: Selector,
    pub(super) events: EventBus,
    pub(super) health: HealthMonitor,
    pub(super) restarts: Mutex<HashMap<String, JoinHandle<()>>>,
    pub(super) initialized: AtomicBool,
}

/// Registers MCP servers, connects to them, aggregates their catalogs and
/// routes calls to the owning server.
#[derive(Clone)]
pub struct McpProxyService {
    inner: Arc<ProxyInner>,
}

impl McpProxyService {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, options: ProxyOptions) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                launcher,
                bootstrap_path: options.bootstrap_path,
                registry: ServerRegistry::new(),
                connections: ConnectionTable::new(),
                stats: StatsStore::new(),
                config: RwLock::new(options.config),
                selector: Selector::new(),
                events: EventBus::new(),
                health: HealthMonitor::new(),
                restarts: Mutex::new(HashMap::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Service that spawns real OS processes.
    pub fn with_process_launcher(options: ProxyOptions) -> Self {
        Self::new(Arc::new(TokioProcessLauncher::new()), options)
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Apply `config` (if given), register bootstrap servers and arm the
    /// health monitor.
    ///
    /// A missing or malformed bootstrap file is logged and skipped.
    pub async fn initialize(&self, config: Option<ProxyConfig>) {
        if let Some(config) = config {
            *self.inner.config_mut() = config;
        }

        if let Some(path) = &self.inner.bootstrap_path {
            match load_bootstrap(path) {
                Ok(bootstrap) => {
                    let definitions = bootstrap.definitions();
                    tracing::info!(
                        path = %path.display(),
                        count = definitions.len(),
                        "loaded bootstrap server definitions"
                    );
                    for definition in definitions {
                        self.register_server(definition);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "bootstrap config unavailable, continuing without it"
                    );
                }
            }
        }

        self.inner.initialized.store(true, Ordering::Release);
        let period = self.inner.config().health_check_period();
        self.inner.health.arm(Arc::downgrade(&self.inner), period);

        tracing::info!(
            servers = self.inner.registry.ids().len(),
            health_interval_ms = ?period.map(|p| p.as_millis()),
            "MCP proxy initialized"
        );
    }

    /// Stop the health monitor and pending restarts, then disconnect every
    /// server. Safe to call repeatedly and before `initialize`.
    pub fn shutdown(&self) {
        let was_initialized = self.inner.initialized.swap(false, Ordering::AcqRel);
        self.inner.health.cancel();
        let restarts: Vec<JoinHandle<()>> = self
            .inner
            .restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in restarts {
            handle.abort();
        }
        self.disconnect_all();
        if was_initialized {
            tracing::info!("MCP proxy shut down");
        }
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Register a server (overwriting an existing id) with fresh state and
    /// zeroed stats. Does not touch any running process.
    pub fn register_server(&self, definition: ServerDefinition) {
        let id = definition.id.clone();
        let replaced = self.inner.registry.register(definition);
        self.inner.stats.add_server(&id);
        tracing::info!(server = %id, replaced, "registered MCP server");
    }

    /// Kill the server's process (if any) and forget it. Unknown ids are a no-op.
    pub fn unregister_server(&self, id: &str) {
        self.inner.cancel_restart(id);
        let had_connection = self.inner.connections.close(id);
        if self.inner.registry.remove(id) {
            self.inner.stats.remove_server(id);
            tracing::info!(server = %id, had_connection, "unregistered MCP server");
        }
        if had_connection {
            self.inner.events.emit(ProxyEvent::Disconnected {
                server_id: id.to_string(),
            });
        }
    }

    pub fn get_server(&self, id: &str) -> Option<ServerSnapshot> {
        self.inner.registry.snapshot(id)
    }

    pub fn get_servers(&self) -> Vec<ServerSnapshot> {
        self.inner.registry.snapshots()
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Connect one server. Returns `false` for unknown or disabled ids and
    /// for any failure; failures are reported through status and events.
    pub async fn connect_server(&self, id: &str) -> bool {
        self.inner.connect(id).await
    }

    /// Connect every enabled server concurrently. Results follow registry order.
    pub async fn connect_all(&self) -> Vec<(String, bool)> {
        let ids: Vec<String> = self
            .inner
            .registry
            .snapshots()
            .into_iter()
            .filter(|s| !s.disabled)
            .map(|s| s.id)
            .collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.inner.connect(id))).await;
        let outcome: Vec<(String, bool)> = ids.into_iter().zip(results).collect();

        let connected = outcome.iter().filter(|(_, ok)| *ok).count();
        tracing::info!(connected, total = outcome.len(), "connect_all finished");
        outcome
    }

    /// Disconnect one server. Returns `false` for unknown ids.
    pub fn disconnect_server(&self, id: &str) -> bool {
        self.inner.cancel_restart(id);
        self.inner.disconnect(id)
    }

    /// Disconnect every server, rejecting their outstanding requests.
    pub fn disconnect_all(&self) {
        for id in self.inner.registry.ids() {
            self.inner.disconnect(&id);
        }
        // Connections whose registry entry is already gone.
        for id in self.inner.connections.close_all() {
            tracing::debug!(server = %id, "closed orphaned connection");
        }
    }

    // ─── Aggregation ─────────────────────────────────────────────────────

    pub fn get_all_tools(&self) -> Vec<McpTool> {
        self.inner.registry.connected_tools()
    }

    pub fn get_all_resources(&self) -> Vec<McpResource> {
        self.inner.registry.connected_resources()
    }

    pub fn get_all_prompts(&self) -> Vec<McpPrompt> {
        self.inner.registry.connected_prompts()
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// Call a tool on the server that owns it.
    ///
    /// An unknown tool yields an error-shaped result rather than `Err`. The
    /// tool's own result, including its `isError` flag, is returned unchanged.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let Some(server_id) = self.inner.route(CapabilityKind::Tool, name) else {
            self.inner.stats.record_unrouted_failure();
            tracing::warn!(tool = %name, "no connected server exposes tool");
            return Ok(ToolCallResult::tool_not_found(name));
        };
        self.inner
            .forward(&server_id, "tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    /// Read a resource from the server that owns it. Unknown URIs are `Err`.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let Some(server_id) = self.inner.route(CapabilityKind::Resource, uri) else {
            self.inner.stats.record_unrouted_failure();
            return Err(McpError::ResourceNotFound { uri: uri.to_string() });
        };
        self.inner
            .forward(&server_id, "resources/read", json!({"uri": uri}))
            .await
    }

    /// Render a prompt on the server that owns it. Unknown names are `Err`.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult, McpError> {
        let Some(server_id) = self.inner.route(CapabilityKind::Prompt, name) else {
            self.inner.stats.record_unrouted_failure();
            return Err(McpError::PromptNotFound { name: name.to_string() });
        };
        self.inner
            .forward(&server_id, "prompts/get", json!({"name": name, "arguments": arguments}))
            .await
    }

    // ─── Stats & Config ──────────────────────────────────────────────────

    pub fn get_stats(&self) -> ProxyStats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn get_config(&self) -> ProxyConfig {
        self.inner.config()
    }

    /// Merge `patch` into the live config. Re-arms the health monitor when the
    /// interval changes; other fields apply from the next operation on.
    pub fn update_config(&self, patch: ProxyConfigPatch) -> ProxyConfig {
        let (config, interval_changed) = {
            let mut config = self.inner.config_mut();
            let changed = config.apply(&patch);
            (config.clone(), changed)
        };

        if interval_changed && self.inner.initialized.load(Ordering::Acquire) {
            self.inner
                .health
                .arm(Arc::downgrade(&self.inner), config.health_check_period());
        }

        tracing::info!(?patch, "proxy config updated");
        self.inner.events.emit(ProxyEvent::ConfigUpdated {
            config: config.clone(),
        });
        config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ProxyInner> {
        &self.inner
    }
}

// ─── ProxyInner ──────────────────────────────────────────────────────────────

impl ProxyInner {
    pub(super) fn config(&self) -> ProxyConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn config_mut(&self) -> std::sync::RwLockWriteGuard<'_, ProxyConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one connection attempt: `connecting → connected | error`.
    pub(super) async fn connect(&self, id: &str) -> bool {
        let Some(definition) = self.registry.definition(id) else {
            return false;
        };
        if definition.disabled {
            tracing::info!(server = %id, "server disabled, not connecting");
            return false;
        }
        let Some(generation) = self.registry.begin_connect(id) else {
            return false;
        };
        self.events.emit(ProxyEvent::Connecting {
            server_id: id.to_string(),
        });

        if self.connections.close(id) {
            tracing::debug!(server = %id, "closed previous connection before reconnecting");
        }

        let timeout = self.config().request_timeout();
        let opened = lifecycle::open_connection(
            self.launcher.as_ref(),
            &definition,
            generation,
            timeout,
            self.events.clone(),
        )
        .await;

        match opened {
            Ok((connection, capabilities)) => {
                let tools = capabilities.tools.len();
                if !self.connections.insert(id, connection) {
                    return false;
                }
                if !self.registry.finish_connect(id, generation, capabilities) {
                    self.connections.close_generation(id, generation);
                    tracing::debug!(server = %id, "discarded connection from superseded attempt");
                    return false;
                }
                tracing::info!(server = %id, tools, "MCP server connected");
                self.events.emit(ProxyEvent::Connected {
                    server_id: id.to_string(),
                });
                true
            }
            Err(e) => {
                if self.registry.fail_connect(id, generation, &e.to_string()) {
                    tracing::warn!(server = %id, error = %e, "MCP server failed to connect");
                    self.events.emit(ProxyEvent::Error {
                        server_id: id.to_string(),
                        error: e.to_string(),
                    });
                }
                false
            }
        }
    }

    /// Close the connection and mark the server disconnected.
    pub(super) fn disconnect(&self, id: &str) -> bool {
        let had_connection = self.connections.close(id);
        let was_active = self
            .registry
            .status(id)
            .is_some_and(|s| s != ServerStatus::Disconnected);
        if !self.registry.mark_disconnected(id) {
            return false;
        }
        if had_connection || was_active {
            tracing::info!(server = %id, "MCP server disconnected");
            self.events.emit(ProxyEvent::Disconnected {
                server_id: id.to_string(),
            });
        }
        true
    }

    pub(super) fn cancel_restart(&self, id: &str) {
        let handle = self
            .restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn route(&self, kind: CapabilityKind, name: &str) -> Option<String> {
        let candidates = router::owners(&self.registry, kind, name);
        let strategy = self.config().load_balancing;
        self.selector
            .select(strategy, kind, name, &candidates, &self.stats)
    }

    /// Send one request to `server_id` and record its outcome in the stats.
    async fn forward<T: DeserializeOwned>(
        &self,
        server_id: &str,
        method: &str,
        params: Value,
    ) -> Result<T, McpError> {
        let start = Instant::now();
        let timeout = self.config().request_timeout();

        let result = async {
            let connection = self
                .connections
                .get(server_id)
                .ok_or_else(|| McpError::NotConnected {
                    server: server_id.to_string(),
                })?;
            let response = connection
                .transport
                .request(method, Some(params), timeout)
                .await?;
            let value = extract_result(response)?;
            serde_json::from_value::<T>(value).map_err(|e| McpError::TransportError {
                server: server_id.to_string(),
                reason: format!("malformed {method} result: {e}"),
            })
        }
        .await;

        match &result {
            Ok(_) => self.stats.record_success(server_id, start.elapsed()),
            Err(e) => {
                self.stats.record_failure(server_id);
                tracing::warn!(server = %server_id, method, error = %e, "routed request failed");
            }
        }
        result
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
