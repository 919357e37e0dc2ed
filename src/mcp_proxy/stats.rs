//! Request counters, globally and per server.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub requests: u64,
    pub errors: u64,
    /// Mean latency of successful requests, in milliseconds.
    pub avg_latency: f64,
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub server_stats: HashMap<String, ServerStats>,
    /// Milliseconds since the service was constructed.
    pub uptime: u64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    total_errors: u64,
    servers: HashMap<String, ServerStats>,
}

/// Live counters. Per-server entries exist exactly while the server is registered.
pub struct StatsStore {
    counters: Mutex<Counters>,
    started: Instant,
}

impl StatsStore {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or zero) the entry for a newly registered server.
    pub fn add_server(&self, id: &str) {
        self.lock().servers.insert(id.to_string(), ServerStats::default());
    }

    pub fn remove_server(&self, id: &str) {
        self.lock().servers.remove(id);
    }

    /// Count a routed request that found no owning server.
    pub fn record_unrouted_failure(&self) {
        let mut c = self.lock();
        c.total_requests += 1;
        c.total_errors += 1;
    }

    /// Count a request forwarded to `server_id`.
    pub fn record_success(&self, server_id: &str, latency: Duration) {
        let mut c = self.lock();
        c.total_requests += 1;
        if let Some(s) = c.servers.get_mut(server_id) {
            s.requests += 1;
            let successes = (s.requests - s.errors) as f64;
            let ms = latency.as_secs_f64() * 1000.0;
            s.avg_latency += (ms - s.avg_latency) / successes;
        }
    }

    pub fn record_failure(&self, server_id: &str) {
        let mut c = self.lock();
        c.total_requests += 1;
        c.total_errors += 1;
        if let Some(s) = c.servers.get_mut(server_id) {
            s.requests += 1;
            s.errors += 1;
        }
    }

    /// Average latency for a server, `None` if it has no successful requests.
    pub fn avg_latency(&self, server_id: &str) -> Option<f64> {
        self.lock()
            .servers
            .get(server_id)
            .filter(|s| s.requests > s.errors)
            .map(|s| s.avg_latency)
    }

    /// Zero global counters and every per-server entry, keeping the entries.
    pub fn reset(&self) {
        let mut c = self.lock();
        c.total_requests = 0;
        c.total_errors = 0;
        for s in c.servers.values_mut() {
            *s = ServerStats::default();
        }
    }

    pub fn snapshot(&self) -> ProxyStats {
        let c = self.lock();
        ProxyStats {
            total_requests: c.total_requests,
            total_errors: c.total_errors,
            server_stats: c.servers.clone(),
            uptime: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}
