use anyhow::Context;
use mcp_federation::mcp_proxy::ProxyEvent;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = mcp_federation::init_tracing().context("failed to initialize logging")?;

    let service = mcp_federation::build_service(
        &mcp_federation::proxy_config_path(),
        mcp_federation::default_bootstrap_path(),
    );
    let mut events = service.subscribe();

    service.initialize(None).await;
    let results = service.connect_all().await;
    for (id, ok) in &results {
        if !ok {
            tracing::warn!(server = %id, "MCP server failed to start (non-fatal)");
        }
    }
    tracing::info!(
        servers = results.len(),
        tools = service.get_all_tools().len(),
        log_file = %log_path.display(),
        "MCP federation running"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(ProxyEvent::Message { .. }) => {}
                Ok(event) => tracing::info!(server = ?event.server_id(), ?event, "proxy event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.shutdown();
    let stats = service.get_stats();
    tracing::info!(
        total_requests = stats.total_requests,
        total_errors = stats.total_errors,
        uptime_ms = stats.uptime,
        "=== MCP federation stopped ==="
    );
    Ok(())
}
