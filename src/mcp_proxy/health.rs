//! Periodic liveness checks for connected servers.
//!
//! A single timer drives every check. On each tick the servers that are due
//! (per-server `healthCheck.intervalMs`, otherwise every tick) are pinged
//! concurrently. A failed or missing connection moves the server to `error`
//! and, when the definition asks for it, schedules an automatic restart.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::errors::McpError;
use super::events::ProxyEvent;
use super::lifecycle::{self, restart_delay};
use super::registry::ServerStatus;
use super::service::ProxyInner;
use super::transport::extract_result;

#[derive(Default)]
struct MonitorState {
    task: Option<JoinHandle<()>>,
    /// Runtime seen on the first `arm`, reused when re-armed from a plain thread.
    runtime: Option<Handle>,
}

/// Owns the timer task. Re-arming replaces the previous task.
#[derive(Default)]
pub struct HealthMonitor {
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the timer. `None` leaves the monitor stopped.
    pub(crate) fn arm(&self, inner: Weak<ProxyInner>, period: Option<Duration>) {
        let mut state = self.lock();
        if let Some(previous) = state.task.take() {
            previous.abort();
        }
        let Some(runtime) = Handle::try_current().ok().or_else(|| state.runtime.clone()) else {
            tracing::warn!("no tokio runtime available, health monitor not armed");
            return;
        };
        state.runtime = Some(runtime.clone());
        match period {
            Some(period) => {
                tracing::debug!(interval_ms = period.as_millis() as u64, "health monitor armed");
                state.task = Some(runtime.spawn(run(inner, period)));
            }
            None => tracing::debug!("health checks disabled"),
        }
    }

    /// Stop the timer. Returns `true` if one was running.
    pub fn cancel(&self) -> bool {
        match self.lock().task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn run(inner: Weak<ProxyInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // The service is gone once every handle has been dropped.
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.health_tick().await;
    }
}

impl ProxyInner {
    /// Ping every due server once.
    pub(crate) async fn health_tick(self: &Arc<Self>) {
        let config = self.config();
        let due = self
            .registry
            .due_for_ping(Instant::now(), config.request_timeout());
        if due.is_empty() {
            return;
        }
        let ttl = config.cache_ttl();
        let checks = due
            .into_iter()
            .map(|(id, generation, timeout)| self.check_server(id, generation, timeout, ttl));
        futures::future::join_all(checks).await;
    }

    async fn check_server(self: &Arc<Self>, id: String, generation: u64, timeout: Duration, ttl: Duration) {
        self.registry.record_ping(&id, Instant::now());

        let Some(connection) = self
            .connections
            .get(&id)
            .filter(|c| c.generation == generation)
        else {
            self.demote(&id, generation, McpError::NotConnected { server: id.clone() });
            return;
        };

        let started = Instant::now();
        let outcome = match connection
            .transport
            .request("ping", None, timeout)
            .await
            .and_then(extract_result)
        {
            Ok(_) => Ok(()),
            // An error reply still proves the process is reading stdin.
            Err(e) if e.is_server_error() => {
                tracing::debug!(server = %id, error = %e, "ping answered with an error");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            self.demote(&id, generation, e);
            return;
        }
        tracing::trace!(server = %id, latency_ms = started.elapsed().as_millis() as u64, "ping ok");

        if self.registry.capabilities_stale(&id, ttl) {
            match lifecycle::discover(&connection.transport, &id, timeout).await {
                Ok(capabilities) => {
                    if self.registry.refresh_capabilities(&id, generation, capabilities) {
                        tracing::debug!(server = %id, "capability cache refreshed");
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %id, error = %e, "capability refresh failed");
                }
            }
        }
    }

    /// Move a connected server to `error` after a failed check.
    fn demote(self: &Arc<Self>, id: &str, generation: u64, error: McpError) {
        let message = error.to_string();
        if !self.registry.mark_unhealthy(id, generation, &message) {
            return;
        }
        tracing::warn!(server = %id, error = %message, "health check failed");
        self.connections.close_generation(id, generation);

        self.events.emit(ProxyEvent::Unhealthy {
            server_id: id.to_string(),
        });
        self.events.emit(ProxyEvent::Error {
            server_id: id.to_string(),
            error: message,
        });

        if self.registry.definition(id).is_some_and(|d| d.auto_restart) {
            self.schedule_restart(id);
        }
    }

    fn schedule_restart(self: &Arc<Self>, id: &str) {
        let mut restarts = self.restarts.lock().unwrap_or_else(PoisonError::into_inner);
        if restarts.contains_key(id) {
            return;
        }
        let handle = tokio::spawn(restart_loop(Arc::downgrade(self), id.to_string()));
        restarts.insert(id.to_string(), handle);
    }

    /// Drop the finished restart entry for `id`.
    ///
    /// A demotion that landed while the entry was still present could not
    /// schedule its own restart, so one is scheduled here instead.
    fn finish_restart(self: &Arc<Self>, id: &str, restored: bool) {
        self.restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        let auto_restart = self
            .registry
            .definition(id)
            .is_some_and(|d| d.auto_restart);
        if restored && auto_restart && self.registry.status(id) == Some(ServerStatus::Error) {
            tracing::info!(server = %id, "server failed again while restarting");
            self.schedule_restart(id);
        }
    }
}

/// Reconnect with exponential backoff, up to `retryAttempts` times.
async fn restart_loop(inner: Weak<ProxyInner>, id: String) {
    let Some(attempts) = inner.upgrade().map(|i| i.config().retry_attempts) else {
        return;
    };

    let mut restored = false;
    for attempt in 0..attempts {
        let delay = restart_delay(attempt);
        tracing::info!(
            server = %id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling restart"
        );
        tokio::time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.registry.status(&id) {
            None | Some(ServerStatus::Disconnected) => break,
            Some(ServerStatus::Connected) => {
                restored = true;
                break;
            }
            Some(ServerStatus::Connecting) | Some(ServerStatus::Error) => {}
        }
        if inner.connect(&id).await {
            restored = true;
            break;
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.finish_restart(&id, restored);

    if restored {
        tracing::info!(server = %id, "server restarted");
    } else if inner.registry.status(&id) == Some(ServerStatus::Error) {
        let err = McpError::RestartExhausted {
            server: id.clone(),
            attempts,
        };
        tracing::warn!(server = %id, error = %err, "giving up on restart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_proxy::config::{HealthCheckOverride, ProxyConfig, ProxyConfigPatch};
    use crate::mcp_proxy::registry::ServerDefinition;
    use crate::mcp_proxy::service::{McpProxyService, ProxyOptions};
    use crate::mcp_proxy::testing::{FakeLauncher, FakeServer};
    use crate::mcp_proxy::types::Capabilities;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    fn service(launcher: &FakeLauncher, config: ProxyConfig) -> McpProxyService {
        McpProxyService::new(
            Arc::new(launcher.clone()),
            ProxyOptions {
                bootstrap_path: None,
                config,
            },
        )
    }

    fn manual() -> ProxyConfig {
        ProxyConfig {
            health_check_interval: 0,
            connection_timeout: 2_000,
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ProxyEvent>) -> ProxyEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    fn count_unhealthy(rx: &mut broadcast::Receiver<ProxyEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ProxyEvent::Unhealthy { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_missing_process_is_demoted_once() {
        let service = service(&FakeLauncher::new(), manual());
        service.register_server(ServerDefinition::new("a", "node", &[]));
        service
            .inner()
            .registry
            .force_state("a", ServerStatus::Connected, Capabilities::default());
        let mut rx = service.subscribe();

        service.inner().health_tick().await;
        service.inner().health_tick().await;

        assert_eq!(
            next_event(&mut rx).await,
            ProxyEvent::Unhealthy { server_id: "a".into() }
        );
        match next_event(&mut rx).await {
            ProxyEvent::Error { server_id, error } => {
                assert_eq!(server_id, "a");
                assert!(error.contains("not connected"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(count_unhealthy(&mut rx), 0);

        let snap = service.get_server("a").unwrap();
        assert_eq!(snap.status, ServerStatus::Error);
        assert!(snap.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_healthy_server_stays_connected() {
        let launcher = FakeLauncher::new();
        let server = FakeServer::with_tools(&["x"]);
        launcher.add("a", server.clone());
        let service = service(&launcher, manual());
        service.register_server(ServerDefinition::new("a", "node", &[]));
        assert!(service.connect_server("a").await);
        let mut rx = service.subscribe();

        service.inner().health_tick().await;

        assert_eq!(server.calls("ping").len(), 1);
        assert_eq!(service.get_server("a").unwrap().status, ServerStatus::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hung_ping_times_out_and_kills() {
        let launcher = FakeLauncher::new();
        let server = FakeServer::with_tools(&["x"]);
        server.ping_hangs.store(true, Ordering::SeqCst);
        launcher.add("a", server);
        let service = service(&launcher, manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.health_check = Some(HealthCheckOverride {
            interval_ms: None,
            timeout_ms: Some(100),
        });
        service.register_server(def);
        assert!(service.connect_server("a").await);
        let mut rx = service.subscribe();

        service.inner().health_tick().await;

        assert_eq!(
            next_event(&mut rx).await,
            ProxyEvent::Unhealthy { server_id: "a".into() }
        );
        let snap = service.get_server("a").unwrap();
        assert_eq!(snap.status, ServerStatus::Error);
        assert!(snap.last_error.unwrap().contains("timed out"));
        assert!(launcher.handle("a").unwrap().was_killed());
        assert!(service.get_all_tools().is_empty());
    }

    #[tokio::test]
    async fn test_per_server_interval_skips_recent_ping() {
        let launcher = FakeLauncher::new();
        let server = FakeServer::with_tools(&[]);
        launcher.add("a", server.clone());
        let service = service(&launcher, manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.health_check = Some(HealthCheckOverride {
            interval_ms: Some(60_000),
            timeout_ms: None,
        });
        service.register_server(def);
        assert!(service.connect_server("a").await);

        service.inner().health_tick().await;
        service.inner().health_tick().await;
        assert_eq!(server.calls("ping").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_capabilities_are_rediscovered() {
        let launcher = FakeLauncher::new();
        let server = FakeServer::with_tools(&["x"]);
        launcher.add("a", server.clone());
        let config = ProxyConfig {
            capability_cache_ttl: 0,
            ..manual()
        };
        let service = service(&launcher, config);
        service.register_server(ServerDefinition::new("a", "node", &[]));
        assert!(service.connect_server("a").await);
        assert_eq!(server.calls("tools/list").len(), 1);

        service.inner().health_tick().await;
        assert_eq!(server.calls("tools/list").len(), 2);
        assert_eq!(service.get_all_tools().len(), 1);
    }

    #[tokio::test]
    async fn test_timer_fires_on_interval() {
        let service = service(
            &FakeLauncher::new(),
            ProxyConfig {
                health_check_interval: 50,
                connection_timeout: 50,
                ..Default::default()
            },
        );
        service.register_server(ServerDefinition::new("a", "node", &[]));
        service.initialize(None).await;
        service
            .inner()
            .registry
            .force_state("a", ServerStatus::Connected, Capabilities::default());
        let mut rx = service.subscribe();

        assert_eq!(
            next_event(&mut rx).await,
            ProxyEvent::Unhealthy { server_id: "a".into() }
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count_unhealthy(&mut rx), 0);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_update_config_rearms_timer() {
        let service = service(&FakeLauncher::new(), manual());
        service.initialize(None).await;
        assert!(!service.inner().health.is_armed());

        service.update_config(ProxyConfigPatch {
            health_check_interval: Some(1_000),
            ..Default::default()
        });
        assert!(service.inner().health.is_armed());

        service.update_config(ProxyConfigPatch {
            health_check_interval: Some(0),
            ..Default::default()
        });
        assert!(!service.inner().health.is_armed());
        service.shutdown();
    }

    #[tokio::test]
    async fn test_auto_restart_reconnects() {
        let launcher = FakeLauncher::new();
        let server = FakeServer::with_tools(&["x"]);
        server.ping_hangs.store(true, Ordering::SeqCst);
        launcher.add("a", server);
        let service = service(&launcher, manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.auto_restart = true;
        def.health_check = Some(HealthCheckOverride {
            interval_ms: None,
            timeout_ms: Some(100),
        });
        service.register_server(def);
        assert!(service.connect_server("a").await);
        let mut rx = service.subscribe();

        service.inner().health_tick().await;

        let mut seen = vec![];
        loop {
            let event = next_event(&mut rx).await;
            let done = matches!(event, ProxyEvent::Connected { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen[0], ProxyEvent::Unhealthy { .. }));
        assert!(seen.contains(&ProxyEvent::Connecting { server_id: "a".into() }));
        assert_eq!(launcher.launches().len(), 2);
        assert_eq!(service.get_server("a").unwrap().status, ServerStatus::Connected);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_restart_gives_up_after_retry_attempts() {
        let launcher = FakeLauncher::new();
        let service = service(
            &launcher,
            ProxyConfig {
                retry_attempts: 1,
                ..manual()
            },
        );
        let mut def = ServerDefinition::new("ghost", "missing", &[]);
        def.auto_restart = true;
        service.register_server(def);
        service
            .inner()
            .registry
            .force_state("ghost", ServerStatus::Connected, Capabilities::default());
        let mut rx = service.subscribe();

        service.inner().health_tick().await;

        let mut errors = 0;
        while errors < 2 {
            if let ProxyEvent::Error { .. } = next_event(&mut rx).await {
                errors += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launches().len(), 1);
        assert!(service.inner().restarts.lock().unwrap().is_empty());
        assert_eq!(service.get_server("ghost").unwrap().status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_restart() {
        let service = service(&FakeLauncher::new(), manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.auto_restart = true;
        service.register_server(def);
        service
            .inner()
            .registry
            .force_state("a", ServerStatus::Connected, Capabilities::default());

        service.inner().health_tick().await;
        assert_eq!(service.inner().restarts.lock().unwrap().len(), 1);

        service.shutdown();
        assert!(service.inner().restarts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_hung_server_does_not_stall_the_others() {
        let launcher = FakeLauncher::new();
        let hung = FakeServer::with_tools(&["slow"]);
        hung.ping_hangs.store(true, Ordering::SeqCst);
        let healthy = FakeServer::with_tools(&["fast"]);
        launcher.add("hung", hung).add("ok", healthy.clone());
        let service = service(&launcher, manual());
        let mut def = ServerDefinition::new("hung", "node", &[]);
        def.health_check = Some(HealthCheckOverride {
            interval_ms: None,
            timeout_ms: Some(300),
        });
        service.register_server(def);
        service.register_server(ServerDefinition::new("ok", "node", &[]));
        service.connect_all().await;

        let started = Instant::now();
        service.inner().health_tick().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
        assert_eq!(healthy.calls("ping").len(), 1);
        assert_eq!(service.get_server("ok").unwrap().status, ServerStatus::Connected);
        assert_eq!(service.get_server("hung").unwrap().status, ServerStatus::Error);
        assert!(!launcher.handle("ok").unwrap().was_killed());
        let tools: Vec<_> = service.get_all_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn test_demotion_during_restart_is_rescheduled() {
        let service = service(&FakeLauncher::new(), manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.auto_restart = true;
        service.register_server(def);
        let inner = service.inner();
        inner
            .restarts
            .lock()
            .unwrap()
            .insert("a".into(), tokio::spawn(async {}));
        // Reconnected, then failed its next ping before the loop cleaned up.
        inner
            .registry
            .force_state("a", ServerStatus::Error, Capabilities::default());
        inner.schedule_restart("a");

        inner.finish_restart("a", true);

        assert!(inner.restarts.lock().unwrap().contains_key("a"));
        service.shutdown();
        assert!(inner.restarts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_restart_without_failure_clears_entry() {
        let service = service(&FakeLauncher::new(), manual());
        let mut def = ServerDefinition::new("a", "node", &[]);
        def.auto_restart = true;
        service.register_server(def);
        let inner = service.inner();
        inner
            .restarts
            .lock()
            .unwrap()
            .insert("a".into(), tokio::spawn(async {}));
        inner
            .registry
            .force_state("a", ServerStatus::Connected, Capabilities::default());

        inner.finish_restart("a", true);

        assert!(inner.restarts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_from_plain_thread_rearms_timer() {
        let service = service(&FakeLauncher::new(), manual());
        service.initialize(None).await;

        let remote = service.clone();
        std::thread::spawn(move || {
            remote.update_config(ProxyConfigPatch {
                health_check_interval: Some(1_000),
                ..Default::default()
            });
        })
        .join()
        .unwrap();

        assert!(service.inner().health.is_armed());
        service.shutdown();
    }
}
