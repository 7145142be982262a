//! Candidate selection strategies
//!
//! The balancer ranks endpoint snapshots into an ordered candidate list for
//! the orchestrator's failover loop. Every strategy first filters out
//! disabled endpoints, endpoints with an Open circuit, and endpoints below
//! the health floor; ties break by static weight (descending) then name
//! (ascending) so orderings are deterministic.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Load balancing strategy selection (runtime-switchable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through eligible endpoints evenly
    RoundRobin,
    /// Distribution proportional to configured static weight
    WeightedRoundRobin,
    /// Rank by rolling average latency, ascending
    LeastLatency,
    /// Rank by in-use connection count, ascending
    LeastConnections,
    /// Strict priority order (weight descending); next endpoint only when
    /// the current one is unusable
    Failover,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

/// Snapshot of one endpoint's selection-relevant state
#[derive(Debug, Clone)]
pub struct EndpointView {
    pub name: String,
    pub weight: u32,
    pub enabled: bool,
    pub circuit_open: bool,
    /// Health score in [0,1]
    pub health: f64,
    /// Rolling average latency in milliseconds (0.0 until first observation)
    pub latency_ms: f64,
    /// Connections currently checked out of the pool
    pub in_use: usize,
}

/// Load balancer over endpoint snapshots
pub struct LoadBalancer {
    strategy: RwLock<Strategy>,
    /// Rotation counter for RoundRobin
    counter: AtomicUsize,
    /// Smooth weighted round-robin running weights, keyed by endpoint name
    wrr_weights: Mutex<HashMap<String, i64>>,
    /// Endpoints scoring below this are excluded from candidate sets
    health_floor: f64,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, health_floor: f64) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            counter: AtomicUsize::new(0),
            wrr_weights: Mutex::new(HashMap::new()),
            health_floor,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.read().map(|s| *s).unwrap_or_default()
    }

    /// Switch the strategy at runtime
    pub fn set_strategy(&self, strategy: Strategy) {
        if let Ok(mut current) = self.strategy.write() {
            *current = strategy;
        }
    }

    /// Produce the ordered candidate list for one request
    pub fn select_candidates(&self, views: &[EndpointView]) -> Vec<String> {
        let mut eligible: Vec<&EndpointView> = views
            .iter()
            .filter(|v| v.enabled && !v.circuit_open && v.health >= self.health_floor)
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        match self.strategy() {
            Strategy::RoundRobin => {
                // Stable cycle order, rotated by the shared counter
                eligible.sort_by(|a, b| a.name.cmp(&b.name));
                let start = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible.rotate_left(start);
            }
            Strategy::WeightedRoundRobin => {
                return self.select_weighted(&mut eligible);
            }
            Strategy::LeastLatency => {
                eligible.sort_by(|a, b| {
                    a.latency_ms
                        .total_cmp(&b.latency_ms)
                        .then_with(|| tie_break(a, b))
                });
            }
            Strategy::LeastConnections => {
                eligible.sort_by(|a, b| a.in_use.cmp(&b.in_use).then_with(|| tie_break(a, b)));
            }
            Strategy::Failover => {
                eligible.sort_by(|a, b| tie_break(a, b));
            }
        }

        eligible.into_iter().map(|v| v.name.clone()).collect()
    }

    /// Smooth weighted round-robin: the first pick follows nginx-style running
    /// weights, the rest fall back to static weight order for failover.
    fn select_weighted(&self, eligible: &mut Vec<&EndpointView>) -> Vec<String> {
        eligible.sort_by(|a, b| tie_break(a, b));

        let first = {
            let Ok(mut weights) = self.wrr_weights.lock() else {
                return eligible.iter().map(|v| v.name.clone()).collect();
            };
            let total: i64 = eligible.iter().map(|v| v.weight.max(1) as i64).sum();
            let mut best: Option<(&EndpointView, i64)> = None;
            for view in eligible.iter() {
                let current = weights.entry(view.name.clone()).or_insert(0);
                *current += view.weight.max(1) as i64;
                match best {
                    Some((_, best_weight)) if *current <= best_weight => {}
                    _ => best = Some((view, *current)),
                }
            }
            let (picked, _) = match best {
                Some(b) => b,
                None => return Vec::new(),
            };
            if let Some(current) = weights.get_mut(&picked.name) {
                *current -= total;
            }
            picked.name.clone()
        };

        let mut ordered = vec![first.clone()];
        ordered.extend(
            eligible
                .iter()
                .filter(|v| v.name != first)
                .map(|v| v.name.clone()),
        );
        ordered
    }
}

/// Deterministic tie-break: weight descending, then name ascending
fn tie_break(a: &EndpointView, b: &EndpointView) -> CmpOrdering {
    b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name))
}
