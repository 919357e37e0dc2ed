pub mod mcp_proxy;

use std::path::{Path, PathBuf};

use mcp_proxy::config::load_proxy_config_or_default;
use mcp_proxy::{McpProxyService, ProxyOptions};

/// Return the platform-standard data directory for the federation service.
///
/// - macOS: `~/Library/Application Support/com.mcp-federation/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.mcp-federation\`
/// - Linux: `$XDG_DATA_HOME/com.mcp-federation/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-federation/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.mcp-federation");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-federation")
}

/// Proxy policy file, `<data_dir>/proxy.yaml`.
pub fn proxy_config_path() -> PathBuf {
    data_dir().join("proxy.yaml")
}

/// Bootstrap server definitions.
///
/// `MCP_FEDERATION_BOOTSTRAP` overrides the default `~/.claude.json`.
pub fn default_bootstrap_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("MCP_FEDERATION_BOOTSTRAP") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".claude.json"))
}

/// Build a service that spawns real processes, with policy read from
/// `config_path` (defaults if missing or malformed).
pub fn build_service(config_path: &Path, bootstrap_path: Option<PathBuf>) -> McpProxyService {
    let config = load_proxy_config_or_default(config_path);
    tracing::info!(
        config_path = %config_path.display(),
        bootstrap = ?bootstrap_path,
        strategy = ?config.load_balancing,
        "building MCP proxy service"
    );
    McpProxyService::with_process_launcher(ProxyOptions {
        bootstrap_path,
        config,
    })
}

/// Initialize the tracing subscriber. Writes structured logs to the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (proxy.log → proxy.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh proxy.log. Each event is one unbuffered `write` to the file.
/// 3. Logs a startup banner with the data directory path for discoverability.
///
/// Returns the log file path.
pub fn init_tracing() -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("proxy.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_federation=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== MCP federation starting ==="
    );

    Ok(log_path)
}

/// Shift `proxy.log.N` up by one and move the current log to `.1`.
///
/// Anything past `keep` is removed. Gaps in the numbering are fine.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = base_path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..=keep).rev() {
        let from = if n == 1 {
            base_path.to_path_buf()
        } else {
            numbered(n - 1)
        };
        if from.exists() {
            let _ = std::fs::rename(&from, numbered(n));
        }
    }
}
