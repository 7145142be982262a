//! Circuit breaker for failing exchange endpoints
//!
//! Three states per endpoint:
//! - Closed: normal operation, requests are allowed
//! - Open: endpoint has failed repeatedly, requests are rejected until cooldown
//! - HalfOpen: probing recovery, exactly one trial request at a time
//!
//! A failure during HalfOpen reopens the circuit with a multiplied cooldown,
//! capped at a configured maximum. A success during HalfOpen closes it and
//! resets the cooldown to its base value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Circuit breaker rejection/error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit open for endpoint {endpoint}, retry in {retry_in:?}")]
    Open { endpoint: String, retry_in: Duration },

    #[error("half-open trial already in flight for endpoint {0}")]
    TrialInFlight(String),

    #[error("endpoint not registered: {0}")]
    EndpointNotFound(String),
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Endpoint has failed - requests are rejected
    Open {
        /// When the circuit may transition to HalfOpen
        until: Instant,

        /// Consecutive failures that tripped the circuit
        failure_count: u32,
    },

    /// Probing recovery - a single trial request is admitted at a time
    HalfOpen {
        /// Whether the trial slot is currently taken
        trial_in_flight: bool,
    },
}

impl CircuitState {
    /// Human-readable state name for status reports
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Base wait before transitioning from Open to HalfOpen
    pub cooldown: Duration,

    /// Multiplier applied to the cooldown on each HalfOpen failure
    pub cooldown_backoff: f64,

    /// Upper bound for the backed-off cooldown
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_backoff: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Per-endpoint circuit state and counters
struct EndpointCircuit {
    state: CircuitState,
    config: CircuitBreakerConfig,

    /// Consecutive failure count while Closed
    consecutive_failures: u32,

    /// Cooldown applied on the next open; grows on repeated HalfOpen failures
    current_cooldown: Duration,

    total_requests: u64,
    total_successes: u64,
    total_failures: u64,

    /// Number of times the circuit has opened
    open_count: u64,

    last_transition: Instant,
}

impl EndpointCircuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            current_cooldown,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    /// Admission check. An `Ok` from a HalfOpen circuit claims the trial slot;
    /// the caller must follow up with `record_*` or `abandon_trial`.
    fn allow(&mut self, endpoint: &str) -> Result<(), CircuitError> {
        self.total_requests += 1;

        match self.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open { until, .. } => {
                let now = Instant::now();
                if now >= until {
                    info!(endpoint = %endpoint, "circuit transitioning from Open to HalfOpen");
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    self.last_transition = now;
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        endpoint: endpoint.to_string(),
                        retry_in: until.saturating_duration_since(now),
                    })
                }
            }

            CircuitState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(CircuitError::TrialInFlight(endpoint.to_string()))
                } else {
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    fn record_success(&mut self, endpoint: &str) {
        self.total_successes += 1;
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::Closed => {}

            CircuitState::Open { .. } => {
                warn!(endpoint = %endpoint, "success recorded while circuit Open");
            }

            CircuitState::HalfOpen { .. } => {
                info!(endpoint = %endpoint, "trial succeeded, circuit closing");
                self.transition_to_closed();
            }
        }
    }

    fn record_failure(&mut self, endpoint: &str) {
        self.total_failures += 1;
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::Closed => {
                debug!(
                    endpoint = %endpoint,
                    consecutive_failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "failure recorded"
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        endpoint = %endpoint,
                        consecutive_failures = self.consecutive_failures,
                        "circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open();
                }
            }

            CircuitState::Open { .. } => {}

            CircuitState::HalfOpen { .. } => {
                // Trial failed: back off the cooldown and reopen
                let backed_off = self.current_cooldown.mul_f64(self.config.cooldown_backoff);
                self.current_cooldown = backed_off.min(self.config.max_cooldown);
                warn!(
                    endpoint = %endpoint,
                    cooldown_ms = self.current_cooldown.as_millis() as u64,
                    "trial failed, circuit reopening"
                );
                self.transition_to_open();
            }
        }
    }

    /// Release a claimed HalfOpen trial slot without an upstream attempt
    /// (e.g. admission denied or pool exhausted after `allow` succeeded).
    fn abandon_trial(&mut self) {
        if let CircuitState::HalfOpen {
            trial_in_flight: true,
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.current_cooldown = self.config.cooldown;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open {
            until: Instant::now() + self.current_cooldown,
            failure_count: self.consecutive_failures,
        };
        self.open_count += 1;
        self.last_transition = Instant::now();
    }

    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_requests as f64
    }
}

/// Circuit breaker statistics for one endpoint
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub error_rate: f64,
    pub open_count: u64,
    pub time_in_state: Duration,
}

/// Circuit breaker manager for all endpoints.
///
/// The outer map is only write-locked at registration/removal; request-path
/// operations take a read lock and then the per-endpoint mutex, so traffic to
/// different endpoints never contends on a shared lock.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, Arc<Mutex<EndpointCircuit>>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register an endpoint with the circuit breaker
    pub async fn register(&self, endpoint: &str) {
        let mut circuits = self.circuits.write().await;
        if !circuits.contains_key(endpoint) {
            debug!(endpoint = %endpoint, "registering endpoint with circuit breaker");
            circuits.insert(
                endpoint.to_string(),
                Arc::new(Mutex::new(EndpointCircuit::new(self.config.clone()))),
            );
        }
    }

    async fn circuit(&self, endpoint: &str) -> Option<Arc<Mutex<EndpointCircuit>>> {
        self.circuits.read().await.get(endpoint).cloned()
    }

    /// Check whether a request to this endpoint is admitted.
    ///
    /// On a HalfOpen circuit an `Ok` claims the single trial slot; the caller
    /// must follow up with `record_result` or `abandon_trial`.
    pub async fn allow(&self, endpoint: &str) -> Result<(), CircuitError> {
        let circuit = self
            .circuit(endpoint)
            .await
            .ok_or_else(|| CircuitError::EndpointNotFound(endpoint.to_string()))?;
        let mut circuit = circuit.lock().await;
        circuit.allow(endpoint)
    }

    /// Record the outcome of an upstream attempt
    pub async fn record_result(&self, endpoint: &str, success: bool) {
        if let Some(circuit) = self.circuit(endpoint).await {
            let mut circuit = circuit.lock().await;
            if success {
                circuit.record_success(endpoint);
            } else {
                circuit.record_failure(endpoint);
            }
        }
    }

    /// Release a claimed HalfOpen trial slot when no upstream call was made
    pub async fn abandon_trial(&self, endpoint: &str) {
        if let Some(circuit) = self.circuit(endpoint).await {
            circuit.lock().await.abandon_trial();
        }
    }

    /// Current state of an endpoint's circuit
    pub async fn state(&self, endpoint: &str) -> Option<CircuitState> {
        match self.circuit(endpoint).await {
            Some(circuit) => Some(circuit.lock().await.state.clone()),
            None => None,
        }
    }

    /// Statistics for an endpoint's circuit
    pub async fn stats(&self, endpoint: &str) -> Option<CircuitStats> {
        let circuit = self.circuit(endpoint).await?;
        let circuit = circuit.lock().await;
        Some(CircuitStats {
            state: circuit.state.clone(),
            total_requests: circuit.total_requests,
            total_successes: circuit.total_successes,
            total_failures: circuit.total_failures,
            error_rate: circuit.error_rate(),
            open_count: circuit.open_count,
            time_in_state: circuit.last_transition.elapsed(),
        })
    }

    /// Manually reset a circuit to Closed
    pub async fn reset(&self, endpoint: &str) {
        if let Some(circuit) = self.circuit(endpoint).await {
            info!(endpoint = %endpoint, "manually resetting circuit to Closed");
            circuit.lock().await.transition_to_closed();
        }
    }

    /// Force a circuit Open for its current cooldown (administrative)
    pub async fn force_open(&self, endpoint: &str) {
        if let Some(circuit) = self.circuit(endpoint).await {
            let mut circuit = circuit.lock().await;
            warn!(endpoint = %endpoint, "forcing circuit Open");
            circuit.transition_to_open();
        }
    }

    /// Remove an endpoint from the circuit breaker
    pub async fn remove(&self, endpoint: &str) {
        let mut circuits = self.circuits.write().await;
        if circuits.remove(endpoint).is_some() {
            info!(endpoint = %endpoint, "removed endpoint from circuit breaker");
        }
    }
}
