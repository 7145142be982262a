use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One configured exchange integration target.
///
/// Immutable after construction except for the administrative `enabled` flag,
/// which can be toggled at runtime without tearing down pools or health state.
#[derive(Debug)]
pub struct Endpoint {
    /// Unique endpoint name (e.g. "binance", "kraken")
    pub name: String,

    /// Static weight used for WeightedRoundRobin distribution, tie-breaking
    /// and Failover priority (higher = preferred)
    pub weight: u32,

    /// Per-request timeout for calls against this endpoint
    pub timeout: Duration,

    /// Administrative toggle; disabled endpoints are never selected
    enabled: AtomicBool,
}

impl Endpoint {
    pub fn new(name: String, weight: u32, timeout: Duration, enabled: bool) -> Self {
        Self {
            name,
            weight,
            timeout,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}
