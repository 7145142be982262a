//! Endpoint health monitoring
//!
//! Tracks a rolling success ratio and latency estimate per endpoint, from two
//! sources: passive results recorded on every real request, and an active
//! probe loop that pings each endpoint on a fixed interval independent of
//! traffic. The derived score in [0,1] feeds load-balancer ranking; the
//! circuit breaker state applies a penalty on top (Open forces 0, HalfOpen
//! caps the score).

use crate::client::ExchangeApi;
use crate::pool::{CircuitBreaker, CircuitState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for health monitoring
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between active probes
    pub probe_interval: Duration,

    /// Timeout for a single probe call
    pub probe_timeout: Duration,

    /// Endpoints scoring below this floor are excluded from candidate sets
    pub score_floor: f64,

    /// Weight of the success ratio in the score
    pub success_weight: f64,

    /// Weight of the latency component in the score
    pub latency_weight: f64,

    /// Latency normalization point: at this latency the latency component
    /// is 0.5, approaching 0 as latency grows
    pub latency_norm: Duration,

    /// Score cap while the circuit is HalfOpen
    pub half_open_cap: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            score_floor: 0.3,
            success_weight: 0.7,
            latency_weight: 0.3,
            latency_norm: Duration::from_millis(500),
            half_open_cap: 0.5,
        }
    }
}

const SUCCESS_EWMA_ALPHA: f64 = 0.2;
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Rolling health measurements for one endpoint
#[derive(Debug)]
struct HealthState {
    /// EWMA of success (1.0) / failure (0.0) outcomes; starts optimistic
    success_ewma: f64,

    /// EWMA latency in milliseconds; None until the first observation
    latency_ewma_ms: Option<f64>,

    last_probe: Option<Instant>,
    probes_run: u64,
}

impl HealthState {
    fn new() -> Self {
        Self {
            success_ewma: 1.0,
            latency_ewma_ms: None,
            last_probe: None,
            probes_run: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_ewma =
            SUCCESS_EWMA_ALPHA * outcome + (1.0 - SUCCESS_EWMA_ALPHA) * self.success_ewma;
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_ewma_ms = Some(match self.latency_ewma_ms {
            Some(prev) => LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * prev,
            None => ms,
        });
    }
}

/// Point-in-time health report for one endpoint
#[derive(Debug, Clone)]
pub struct HealthStats {
    pub score: f64,
    pub success_rate: f64,
    pub latency_ewma_ms: Option<f64>,
    pub last_probe_age: Option<Duration>,
    pub probes_run: u64,
}

struct Entry {
    state: std::sync::RwLock<HealthState>,
    client: Arc<dyn ExchangeApi>,
}

/// Health monitor for all endpoints
pub struct HealthMonitor {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    breaker: Arc<CircuitBreaker>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            breaker,
            config,
        }
    }

    pub fn score_floor(&self) -> f64 {
        self.config.score_floor
    }

    /// Register an endpoint with its probe client
    pub async fn register(&self, endpoint: &str, client: Arc<dyn ExchangeApi>) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(endpoint) {
            debug!(endpoint = %endpoint, "registering endpoint with health monitor");
            entries.insert(
                endpoint.to_string(),
                Arc::new(Entry {
                    state: std::sync::RwLock::new(HealthState::new()),
                    client,
                }),
            );
        }
    }

    async fn entry(&self, endpoint: &str) -> Option<Arc<Entry>> {
        self.entries.read().await.get(endpoint).cloned()
    }

    /// Record a passive result from the request path
    pub async fn record_result(&self, endpoint: &str, success: bool, latency: Duration) {
        if let Some(entry) = self.entry(endpoint).await {
            if let Ok(mut state) = entry.state.write() {
                state.record(success, latency);
            }
        }
    }

    fn base_score(&self, state: &HealthState) -> f64 {
        let latency_component = match state.latency_ewma_ms {
            // Inverse-normalized: norm/(norm + latency), 1.0 at zero latency
            Some(ms) => {
                let norm = self.config.latency_norm.as_secs_f64() * 1000.0;
                norm / (norm + ms)
            }
            None => 1.0,
        };
        let total = self.config.success_weight + self.config.latency_weight;
        if total <= 0.0 {
            return 1.0;
        }
        (self.config.success_weight * state.success_ewma
            + self.config.latency_weight * latency_component)
            / total
    }

    /// Health score in [0,1] with the circuit-breaker penalty applied
    pub async fn score(&self, endpoint: &str) -> Option<f64> {
        let entry = self.entry(endpoint).await?;
        let base = match entry.state.read() {
            Ok(state) => self.base_score(&state),
            Err(_) => return Some(0.0),
        };
        let score = match self.breaker.state(endpoint).await {
            Some(CircuitState::Open { .. }) => 0.0,
            Some(CircuitState::HalfOpen { .. }) => base.min(self.config.half_open_cap),
            _ => base,
        };
        Some(score.clamp(0.0, 1.0))
    }

    /// Point-in-time stats for status reports
    pub async fn stats(&self, endpoint: &str) -> Option<HealthStats> {
        let entry = self.entry(endpoint).await?;
        let score = self.score(endpoint).await.unwrap_or(0.0);
        let state = entry.state.read().ok()?;
        Some(HealthStats {
            score,
            success_rate: state.success_ewma,
            latency_ewma_ms: state.latency_ewma_ms,
            last_probe_age: state.last_probe.map(|t| t.elapsed()),
            probes_run: state.probes_run,
        })
    }

    /// Run one active probe against an endpoint
    pub async fn probe(&self, endpoint: &str) {
        let Some(entry) = self.entry(endpoint).await else {
            return;
        };
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.config.probe_timeout,
            entry.client.ping(self.config.probe_timeout),
        )
        .await;
        let latency = start.elapsed();
        let success = matches!(result, Ok(Ok(())));

        if let Ok(mut state) = entry.state.write() {
            state.record(success, latency);
            state.last_probe = Some(Instant::now());
            state.probes_run += 1;
        }

        if success {
            debug!(
                endpoint = %endpoint,
                latency_ms = latency.as_millis() as u64,
                "health probe ok"
            );
        } else {
            warn!(
                endpoint = %endpoint,
                latency_ms = latency.as_millis() as u64,
                "health probe failed"
            );
        }
    }

    /// Probe every registered endpoint once (out-of-band trigger)
    pub async fn probe_all(&self) {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for name in names {
            self.probe(&name).await;
        }
    }

    /// Spawn one independent probe loop per registered endpoint
    pub async fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        info!(
            endpoints = names.len(),
            interval_secs = self.config.probe_interval.as_secs(),
            "health monitor started"
        );
        names
            .into_iter()
            .map(|name| {
                let monitor = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(monitor.config.probe_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // First tick fires immediately; skip it so startup traffic
                    // is not delayed behind a probe burst
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        monitor.probe(&name).await;
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CallError;
    use crate::pool::CircuitBreakerConfig;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct ScriptedClient {
        healthy: AtomicBool,
        pings: AtomicU64,
    }

    impl ScriptedClient {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                pings: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl ExchangeApi for ScriptedClient {
        async fn call(
            &self,
            method: &str,
            _params: &Value,
            _timeout: Duration,
        ) -> Result<Value, CallError> {
            if method == "ping" {
                self.pings.fetch_add(1, Ordering::Relaxed);
            }
            if self.healthy.load(Ordering::Relaxed) {
                Ok(Value::Null)
            } else {
                Err(CallError::Transport("unreachable".to_string()))
            }
        }
    }

    fn monitor() -> (Arc<HealthMonitor>, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            Arc::clone(&breaker),
        ));
        (monitor, breaker)
    }

    #[tokio::test]
    async fn test_fresh_endpoint_scores_high() {
        let (monitor, breaker) = monitor();
        breaker.register("binance").await;
        monitor.register("binance", ScriptedClient::new(true)).await;

        let score = monitor.score("binance").await.unwrap();
        assert!(score > 0.9);
    }

    #[tokio::test]
    async fn test_failures_lower_score() {
        let (monitor, breaker) = monitor();
        breaker.register("binance").await;
        monitor.register("binance", ScriptedClient::new(true)).await;

        for _ in 0..10 {
            monitor
                .record_result("binance", false, Duration::from_millis(50))
                .await;
        }
        let score = monitor.score("binance").await.unwrap();
        assert!(score < 0.5);
    }

    #[tokio::test]
    async fn test_open_circuit_forces_zero() {
        let (monitor, breaker) = monitor();
        breaker.register("binance").await;
        monitor.register("binance", ScriptedClient::new(true)).await;

        breaker.force_open("binance").await;
        assert_eq!(monitor.score("binance").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_half_open_caps_score() {
        let breaker_cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            ..Default::default()
        };
        let breaker = Arc::new(CircuitBreaker::new(breaker_cfg));
        let monitor = Arc::new(HealthMonitor::new(HealthConfig::default(), breaker.clone()));
        breaker.register("binance").await;
        monitor.register("binance", ScriptedClient::new(true)).await;

        breaker.record_result("binance", false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Claims the half-open trial slot
        assert!(breaker.allow("binance").await.is_ok());

        let score = monitor.score("binance").await.unwrap();
        assert!(score <= 0.5);
    }

    #[tokio::test]
    async fn test_probe_records_outcome() {
        let (monitor, breaker) = monitor();
        breaker.register("binance").await;
        let client = ScriptedClient::new(false);
        monitor.register("binance", client.clone()).await;

        for _ in 0..10 {
            monitor.probe("binance").await;
        }
        assert_eq!(client.pings.load(Ordering::Relaxed), 10);

        let stats = monitor.stats("binance").await.unwrap();
        assert_eq!(stats.probes_run, 10);
        assert!(stats.score < 0.5);
        assert!(stats.last_probe_age.is_some());
    }

    #[tokio::test]
    async fn test_latency_component() {
        let (monitor, breaker) = monitor();
        breaker.register("slow").await;
        breaker.register("fast").await;
        monitor.register("slow", ScriptedClient::new(true)).await;
        monitor.register("fast", ScriptedClient::new(true)).await;

        for _ in 0..5 {
            monitor
                .record_result("slow", true, Duration::from_millis(2000))
                .await;
            monitor
                .record_result("fast", true, Duration::from_millis(10))
                .await;
        }
        let slow = monitor.score("slow").await.unwrap();
        let fast = monitor.score("fast").await.unwrap();
        assert!(fast > slow);
    }
}
