//! Server connection lifecycle: spawn, handshake, discovery, teardown.
//!
//! A connection is opened in three steps:
//! 1. Resolve the full child environment and launch the process
//! 2. `initialize` handshake followed by `notifications/initialized`
//! 3. `tools/list`, `resources/list`, `prompts/list` discovery
//!
//! Live connections are kept in a `ConnectionTable`, which is the only owner
//! of process handles in the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::errors::McpError;
use super::events::EventBus;
use super::launcher::{resolve_environment, LaunchSpec, ProcessLauncher};
use super::registry::ServerDefinition;
use super::transport::{extract_result, StdioTransport};
use super::types::{Capabilities, InitializeResult, McpPrompt, McpResource, McpTool, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single restart delay.
const RESTART_MAX_DELAY: Duration = Duration::from_secs(60);

/// Maximum pages followed for one paginated list call.
const MAX_LIST_PAGES: usize = 32;

// ─── Connections ─────────────────────────────────────────────────────────────

/// A live, initialized server connection.
pub struct Connection {
    pub transport: StdioTransport,
    /// Registry generation of the attempt that opened this connection.
    pub generation: u64,
}

/// Live connections by server id.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.lock().get(id).cloned()
    }

    /// Store a connection, closing whatever it replaces.
    ///
    /// A connection from an older generation than the stored one is closed
    /// instead and `false` is returned.
    pub fn insert(&self, id: &str, connection: Connection) -> bool {
        let mut connections = self.lock();
        if connections
            .get(id)
            .is_some_and(|existing| existing.generation > connection.generation)
        {
            drop(connections);
            connection.transport.close();
            return false;
        }
        let previous = connections.insert(id.to_string(), Arc::new(connection));
        drop(connections);
        if let Some(previous) = previous {
            previous.transport.close();
        }
        true
    }

    /// Remove and close the connection for `id`. Returns `true` if one existed.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(connection) => {
                connection.transport.close();
                true
            }
            None => false,
        }
    }

    /// Close the connection for `id` only if it belongs to `generation`.
    pub fn close_generation(&self, id: &str, generation: u64) -> bool {
        let removed = {
            let mut connections = self.lock();
            match connections.get(id) {
                Some(c) if c.generation == generation => connections.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(connection) => {
                connection.transport.close();
                true
            }
            None => false,
        }
    }

    /// Close every connection, returning the ids that were closed.
    pub fn close_all(&self) -> Vec<String> {
        let drained: Vec<(String, Arc<Connection>)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(id, connection)| {
                connection.transport.close();
                id
            })
            .collect()
    }
}

// ─── Opening ─────────────────────────────────────────────────────────────────

/// Launch a server, run the handshake, and discover its catalogs.
///
/// The environment is fully resolved before the launcher is called. On any
/// failure after spawn the process is killed before returning.
pub async fn open_connection(
    launcher: &dyn ProcessLauncher,
    definition: &ServerDefinition,
    generation: u64,
    timeout: Duration,
    events: EventBus,
) -> Result<(Connection, Capabilities), McpError> {
    let spec = LaunchSpec {
        server_id: definition.id.clone(),
        command: definition.command.clone(),
        args: definition.args.clone(),
        env: resolve_environment(&definition.env),
    };

    let launched = launcher.launch(&spec)?;
    let transport = StdioTransport::start(&definition.id, launched, events);

    match handshake(&transport, &definition.id, timeout).await {
        Ok(capabilities) => Ok((
            Connection {
                transport,
                generation,
            },
            capabilities,
        )),
        Err(e) => {
            transport.close();
            Err(match e {
                McpError::InitFailed { .. } => e,
                other => McpError::InitFailed {
                    server: definition.id.clone(),
                    reason: other.to_string(),
                },
            })
        }
    }
}

/// Perform the MCP initialization handshake and capability discovery.
async fn handshake(
    transport: &StdioTransport,
    server_id: &str,
    timeout: Duration,
) -> Result<Capabilities, McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });

    let response = transport.request("initialize", Some(params), timeout).await?;
    let result = extract_result(response)?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            server: server_id.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    tracing::info!(
        server = %server_id,
        protocol = ?init.protocol_version,
        server_name = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
        server_version = ?init.server_info.as_ref().and_then(|i| i.version.clone()),
        "MCP server initialized"
    );

    transport.notify("notifications/initialized", None).await?;

    discover(transport, server_id, timeout).await
}

/// List tools, resources and prompts, stamping each record with `server_id`.
///
/// A list call answered with a JSON-RPC error means the server lacks that
/// capability and yields an empty catalog.
pub async fn discover(
    transport: &StdioTransport,
    server_id: &str,
    timeout: Duration,
) -> Result<Capabilities, McpError> {
    let mut tools: Vec<McpTool> = list(transport, server_id, "tools/list", "tools", timeout).await?;
    let mut resources: Vec<McpResource> =
        list(transport, server_id, "resources/list", "resources", timeout).await?;
    let mut prompts: Vec<McpPrompt> =
        list(transport, server_id, "prompts/list", "prompts", timeout).await?;

    tools.iter_mut().for_each(|t| t.server_id = server_id.to_string());
    resources.iter_mut().for_each(|r| r.server_id = server_id.to_string());
    prompts.iter_mut().for_each(|p| p.server_id = server_id.to_string());

    tracing::info!(
        server = %server_id,
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "capabilities discovered"
    );

    Ok(Capabilities {
        tools,
        resources,
        prompts,
    })
}

async fn list<T: DeserializeOwned>(
    transport: &StdioTransport,
    server_id: &str,
    method: &str,
    key: &str,
    timeout: Duration,
) -> Result<Vec<T>, McpError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| json!({"cursor": c}));
        let result = match transport
            .request(method, params, timeout)
            .await
            .and_then(extract_result)
        {
            Ok(result) => result,
            Err(e) if e.is_server_error() => {
                tracing::debug!(server = %server_id, method, error = %e, "capability not supported");
                return Ok(items);
            }
            Err(e) => return Err(e),
        };

        let page = result.get(key).cloned().unwrap_or(Value::Array(vec![]));
        let parsed: Vec<T> = serde_json::from_value(page).map_err(|e| McpError::InitFailed {
            server: server_id.to_string(),
            reason: format!("malformed {method} response: {e}"),
        })?;
        items.extend(parsed);

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        if cursor.is_none() {
            break;
        }
    }

    Ok(items)
}

/// Exponential backoff for restart `attempt` (0-based): 1s, 2s, 4s, ...
pub fn restart_delay(attempt: u32) -> Duration {
    RESTART_BASE_DELAY
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(RESTART_MAX_DELAY, |d| d.min(RESTART_MAX_DELAY))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
