//! Capability routing: resolve a tool/resource/prompt to its owning server.
//!
//! Candidates are the connected servers whose catalog contains the name, in
//! registry order. The configured `LoadBalancingStrategy` picks one.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::config::LoadBalancingStrategy;
use super::registry::ServerRegistry;
use super::stats::StatsStore;

/// What is being routed. Used as the round-robin rotation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// Connected servers exposing `name` (a URI for resources), in registry order.
pub fn owners(registry: &ServerRegistry, kind: CapabilityKind, name: &str) -> Vec<String> {
    match kind {
        CapabilityKind::Tool => registry.connected_owners(|c| c.tools.iter().any(|t| t.name == name)),
        CapabilityKind::Resource => {
            registry.connected_owners(|c| c.resources.iter().any(|r| r.uri == name))
        }
        CapabilityKind::Prompt => {
            registry.connected_owners(|c| c.prompts.iter().any(|p| p.name == name))
        }
    }
}

/// Chooses among candidate servers according to the strategy.
#[derive(Default)]
pub struct Selector {
    rotation: Mutex<HashMap<(CapabilityKind, String), usize>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(
        &self,
        strategy: LoadBalancingStrategy,
        kind: CapabilityKind,
        name: &str,
        candidates: &[String],
        stats: &StatsStore,
    ) -> Option<String> {
        if candidates.len() <= 1 {
            return candidates.first().cloned();
        }

        match strategy {
            LoadBalancingStrategy::CapabilityBased => candidates.first().cloned(),
            LoadBalancingStrategy::RoundRobin => {
                let mut rotation = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
                let next = rotation.entry((kind, name.to_string())).or_insert(0);
                let chosen = candidates[*next % candidates.len()].clone();
                *next = next.wrapping_add(1);
                Some(chosen)
            }
            LoadBalancingStrategy::LeastLatency => {
                // Servers without a measurement yet sort first so they get one.
                let mut best: Option<(&String, f64)> = None;
                for id in candidates {
                    let latency = stats.avg_latency(id).unwrap_or(0.0);
                    if best.map_or(true, |(_, b)| latency < b) {
                        best = Some((id, latency));
                    }
                }
                best.map(|(id, _)| id.clone())
            }
        }
    }
}
