//! Request orchestration across exchange endpoints
//!
//! [`ExchangeManager`] owns every per-endpoint component (rate limiter,
//! circuit breaker, connection pool, health monitor) plus the load balancer,
//! and drives one request through the full admission pipeline:
//!
//! 1. resolve candidates (pinned endpoint, or balancer-ordered list)
//! 2. per candidate: circuit admission, rate-limit admission, pool borrow,
//!    deadline-bounded API call
//! 3. on failure, record the outcome everywhere and fall through to the next
//!    candidate; when the list is exhausted, return the aggregate error
//!
//! Borrowed connections are returned on every path, success or failure, and
//! no step waits past the request deadline.

use crate::client::{CallError, ExchangeApi};
use crate::config::Config;
use crate::lb::{Endpoint, EndpointView, HealthConfig, HealthMonitor, HealthStats, LoadBalancer, Strategy};
use crate::limit::{Admission, Priority, RateLimitConfig, RateLimiter, SharedUsage};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitStats, ConnectionPool, PoolConfig,
    PoolError, PoolStats,
};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One request to route through the manager
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Exchange API method name (e.g. "fetch_ticker")
    pub method: String,

    /// Method parameters, passed through opaque
    pub params: Value,

    /// Route to exactly this endpoint instead of balancing
    pub pinned: Option<String>,

    /// Rate-limit admission class
    pub priority: Priority,

    /// Request deadline; the manager default applies when None
    pub timeout: Option<Duration>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Value::Null,
            pinned: None,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn pinned(mut self, endpoint: impl Into<String>) -> Self {
        self.pinned = Some(endpoint.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why one candidate endpoint could not serve the request
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptError {
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("half-open trial already in flight")]
    TrialInFlight,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Upstream(CallError),

    #[error("endpoint not registered")]
    NotRegistered,

    #[error("manager shut down")]
    Shutdown,
}

/// One entry in the [`ExecuteError::AllCandidatesExhausted`] aggregate
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub endpoint: String,
    pub error: AttemptError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

fn format_failures(failures: &[CandidateFailure]) -> String {
    if failures.is_empty() {
        return "no eligible endpoints".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Terminal error for one [`ExchangeManager::execute`] call
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Every candidate failed; carries the per-endpoint reasons in attempt order
    #[error("all candidates exhausted: {}", format_failures(.0))]
    AllCandidatesExhausted(Vec<CandidateFailure>),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

/// Point-in-time status report for one endpoint
#[derive(Debug)]
pub struct EndpointStatus {
    pub name: String,
    pub enabled: bool,
    pub weight: u32,
    pub circuit: Option<CircuitStats>,
    pub health: Option<HealthStats>,
    pub pool: Option<PoolStats>,
    pub metrics: Option<MetricsSnapshot>,
}

/// Orchestrator over all exchange endpoints
pub struct ExchangeManager {
    config: Config,
    endpoints: HashMap<String, Arc<Endpoint>>,
    clients: HashMap<String, Arc<dyn ExchangeApi>>,

    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub pool: Arc<ConnectionPool>,
    pub health: Arc<HealthMonitor>,
    pub balancer: Arc<LoadBalancer>,
    pub metrics: Arc<MetricsRegistry>,

    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ExchangeManager {
    /// Build a manager from configuration plus one API client per endpoint
    pub async fn new(
        config: Config,
        clients: HashMap<String, Arc<dyn ExchangeApi>>,
    ) -> Result<Arc<Self>> {
        Self::build(config, clients, None).await
    }

    /// Like [`ExchangeManager::new`] with a distributed usage backend attached
    /// to the rate limiter.
    pub async fn with_shared_usage(
        config: Config,
        clients: HashMap<String, Arc<dyn ExchangeApi>>,
        shared: Arc<dyn SharedUsage>,
    ) -> Result<Arc<Self>> {
        Self::build(config, clients, Some(shared)).await
    }

    async fn build(
        config: Config,
        clients: HashMap<String, Arc<dyn ExchangeApi>>,
        shared: Option<Arc<dyn SharedUsage>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        for name in config.endpoints.keys() {
            if !clients.contains_key(name) {
                anyhow::bail!("no API client supplied for endpoint '{}'", name);
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit.failure_threshold,
            cooldown: Duration::from_secs(config.circuit.cooldown_secs),
            cooldown_backoff: config.circuit.cooldown_backoff,
            max_cooldown: Duration::from_secs(config.circuit.max_cooldown_secs),
        }));

        let mut limiter = RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(config.rate.window_secs),
            high_multiplier: config.rate.high_multiplier,
            normal_multiplier: config.rate.normal_multiplier,
            low_multiplier: config.rate.low_multiplier,
        });
        if let Some(shared) = shared {
            limiter = limiter.with_shared(shared);
        }
        let limiter = Arc::new(limiter);

        let pool = Arc::new(ConnectionPool::new(config.sweep_interval()));
        let health = Arc::new(HealthMonitor::new(
            HealthConfig {
                probe_interval: Duration::from_secs(config.health.probe_interval_secs),
                probe_timeout: Duration::from_secs(config.health.probe_timeout_secs),
                score_floor: config.health.score_floor,
                ..HealthConfig::default()
            },
            Arc::clone(&breaker),
        ));
        let balancer = Arc::new(LoadBalancer::new(config.strategy, config.health.score_floor));
        let metrics = Arc::new(MetricsRegistry::new());

        let mut endpoints = HashMap::new();
        for (name, ep) in &config.endpoints {
            breaker.register(name).await;
            limiter.register(name, ep.rate_quota).await;
            pool.register(
                name,
                PoolConfig {
                    max_connections: ep.pool_max,
                    min_connections: ep.pool_min,
                    idle_timeout: ep.idle_timeout(),
                    borrow_timeout: config.borrow_timeout(),
                    ..PoolConfig::default()
                },
            )
            .await;
            // Client presence was checked above
            if let Some(client) = clients.get(name) {
                health.register(name, Arc::clone(client)).await;
            }
            metrics.register(name);
            endpoints.insert(
                name.clone(),
                Arc::new(Endpoint::new(
                    name.clone(),
                    ep.weight,
                    ep.timeout(),
                    ep.enabled,
                )),
            );
        }

        info!(
            endpoints = endpoints.len(),
            strategy = ?config.strategy,
            "exchange manager initialized"
        );

        Ok(Arc::new(Self {
            config,
            endpoints,
            clients,
            limiter,
            breaker,
            pool,
            health,
            balancer,
            metrics,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn background maintenance: health probe loops and the idle sweeper
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.extend(self.health.start().await);
        tasks.push(self.pool.start_sweeper());
    }

    /// Stop background tasks and close all pools
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.pool.shutdown().await;
        info!("exchange manager shut down");
    }

    /// Snapshot the selection-relevant state of every endpoint
    async fn views(&self) -> Vec<EndpointView> {
        let mut views = Vec::with_capacity(self.endpoints.len());
        for (name, ep) in &self.endpoints {
            let circuit_open = self
                .breaker
                .state(name)
                .await
                .map(|s| s.is_open())
                .unwrap_or(true);
            let health = self.health.stats(name).await;
            let in_use = self
                .pool
                .stats(name)
                .await
                .map(|s| s.in_use)
                .unwrap_or(0);
            views.push(EndpointView {
                name: name.clone(),
                weight: ep.weight,
                enabled: ep.is_enabled(),
                circuit_open,
                health: health.as_ref().map(|h| h.score).unwrap_or(0.0),
                latency_ms: health
                    .as_ref()
                    .and_then(|h| h.latency_ewma_ms)
                    .unwrap_or(0.0),
                in_use,
            });
        }
        views
    }

    /// Route one request, failing over through the candidate list.
    ///
    /// Pinned requests bypass balancing entirely but still pass through the
    /// pinned endpoint's circuit, rate limit and pool.
    pub async fn execute(&self, envelope: RequestEnvelope) -> Result<Value, ExecuteError> {
        let deadline = Instant::now()
            + envelope
                .timeout
                .unwrap_or_else(|| self.config.default_request_timeout());

        let candidates = match &envelope.pinned {
            Some(name) => {
                if !self.endpoints.contains_key(name) {
                    return Err(ExecuteError::UnknownEndpoint(name.clone()));
                }
                vec![name.clone()]
            }
            None => {
                let views = self.views().await;
                self.balancer.select_candidates(&views)
            }
        };

        let mut failures = Vec::new();
        for name in candidates {
            if Instant::now() >= deadline {
                warn!(method = %envelope.method, "deadline exceeded before candidates exhausted");
                return Err(ExecuteError::DeadlineExceeded);
            }
            match self.try_candidate(&name, &envelope, deadline).await {
                Ok(value) => {
                    debug!(endpoint = %name, method = %envelope.method, "request served");
                    return Ok(value);
                }
                Err(error) => {
                    debug!(endpoint = %name, method = %envelope.method, error = %error, "candidate attempt failed");
                    failures.push(CandidateFailure {
                        endpoint: name,
                        error,
                    });
                }
            }
        }

        warn!(
            method = %envelope.method,
            attempts = failures.len(),
            "all candidates exhausted"
        );
        Err(ExecuteError::AllCandidatesExhausted(failures))
    }

    /// Run the full admission pipeline and call against one endpoint
    async fn try_candidate(
        &self,
        name: &str,
        envelope: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<Value, AttemptError> {
        let metrics = self.metrics.get(name);

        // Circuit admission; an Ok on a HalfOpen circuit claims the trial
        // slot, so every early exit below must abandon it
        if let Err(err) = self.breaker.allow(name).await {
            if let Some(m) = &metrics {
                m.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            return Err(match err {
                CircuitError::Open { retry_in, .. } => AttemptError::CircuitOpen { retry_in },
                CircuitError::TrialInFlight(_) => AttemptError::TrialInFlight,
                CircuitError::EndpointNotFound(_) => AttemptError::NotRegistered,
            });
        }

        // Rate-limit admission, with one bounded wait when the hint fits
        // inside both the deadline and the configured cap
        let mut admission = match self.limiter.acquire(name, envelope.priority).await {
            Ok(admission) => admission,
            Err(_) => {
                self.breaker.abandon_trial(name).await;
                return Err(AttemptError::NotRegistered);
            }
        };
        if let Admission::Denied { retry_after } = admission {
            if retry_after <= self.config.max_admission_wait()
                && Instant::now() + retry_after < deadline
            {
                tokio::time::sleep(retry_after).await;
                admission = match self.limiter.acquire(name, envelope.priority).await {
                    Ok(admission) => admission,
                    Err(_) => {
                        self.breaker.abandon_trial(name).await;
                        return Err(AttemptError::NotRegistered);
                    }
                };
            }
        }
        if let Admission::Denied { retry_after } = admission {
            self.breaker.abandon_trial(name).await;
            if let Some(m) = &metrics {
                m.admission_rejections.fetch_add(1, Ordering::Relaxed);
            }
            return Err(AttemptError::RateLimited { retry_after });
        }

        // Pool borrow, capped at the remaining deadline budget
        let remaining = deadline.saturating_duration_since(Instant::now());
        let borrow_budget = self.config.borrow_timeout().min(remaining);
        let mut conn = match self.pool.borrow_with_timeout(name, borrow_budget).await {
            Ok(conn) => conn,
            Err(err) => {
                self.breaker.abandon_trial(name).await;
                return Err(match err {
                    PoolError::Exhausted(_) => {
                        if let Some(m) = &metrics {
                            m.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
                        }
                        AttemptError::PoolExhausted
                    }
                    PoolError::EndpointNotFound(_) => AttemptError::NotRegistered,
                    PoolError::Shutdown => AttemptError::Shutdown,
                });
            }
        };

        let Some(client) = self.clients.get(name) else {
            self.breaker.abandon_trial(name).await;
            self.pool.give_back(conn).await;
            return Err(AttemptError::NotRegistered);
        };

        let call_budget = self
            .endpoints
            .get(name)
            .map(|ep| ep.timeout)
            .unwrap_or_else(|| self.config.default_request_timeout())
            .min(deadline.saturating_duration_since(Instant::now()));

        if let Some(m) = &metrics {
            m.requests.fetch_add(1, Ordering::Relaxed);
        }

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            call_budget,
            client.call(&envelope.method, &envelope.params, call_budget),
        )
        .await;
        let latency = start.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                conn.mark_success(latency);
                self.pool.give_back(conn).await;
                self.breaker.record_result(name, true).await;
                self.health.record_result(name, true, latency).await;
                if let Some(m) = &metrics {
                    m.successes.fetch_add(1, Ordering::Relaxed);
                    m.latency.observe(latency);
                }
                Ok(value)
            }
            Ok(Err(err)) => {
                conn.mark_failure();
                self.pool.give_back(conn).await;
                self.breaker.record_result(name, false).await;
                self.health.record_result(name, false, latency).await;
                if let Some(m) = &metrics {
                    m.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(AttemptError::Upstream(err))
            }
            Err(_) => {
                conn.mark_failure();
                self.pool.give_back(conn).await;
                self.breaker.record_result(name, false).await;
                self.health.record_result(name, false, latency).await;
                if let Some(m) = &metrics {
                    m.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(AttemptError::Timeout)
            }
        }
    }

    /// Current load balancing strategy
    pub fn strategy(&self) -> Strategy {
        self.balancer.strategy()
    }

    /// Switch the balancing strategy at runtime
    pub fn set_strategy(&self, strategy: Strategy) {
        info!(strategy = ?strategy, "switching load balancing strategy");
        self.balancer.set_strategy(strategy);
    }

    /// Administratively enable or disable an endpoint
    pub fn set_enabled(&self, endpoint: &str, enabled: bool) -> Result<(), ExecuteError> {
        let ep = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| ExecuteError::UnknownEndpoint(endpoint.to_string()))?;
        info!(endpoint = %endpoint, enabled = enabled, "endpoint toggled");
        ep.set_enabled(enabled);
        Ok(())
    }

    /// Run an out-of-band probe: one endpoint, or every endpoint when None
    pub async fn trigger_health_check(&self, endpoint: Option<&str>) {
        match endpoint {
            Some(name) => self.health.probe(name).await,
            None => self.health.probe_all().await,
        }
    }

    /// Manually close an endpoint's circuit
    pub async fn reset_circuit(&self, endpoint: &str) {
        self.breaker.reset(endpoint).await;
    }

    /// Full status report for one endpoint
    pub async fn endpoint_status(&self, endpoint: &str) -> Result<EndpointStatus, ExecuteError> {
        let ep = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| ExecuteError::UnknownEndpoint(endpoint.to_string()))?;
        Ok(EndpointStatus {
            name: ep.name.clone(),
            enabled: ep.is_enabled(),
            weight: ep.weight,
            circuit: self.breaker.stats(endpoint).await,
            health: self.health.stats(endpoint).await,
            pool: self.pool.stats(endpoint).await,
            metrics: self.metrics.get(endpoint).map(|m| m.snapshot()),
        })
    }

    /// Status reports for every endpoint, sorted by name
    pub async fn all_statuses(&self) -> Vec<EndpointStatus> {
        let mut names: Vec<&String> = self.endpoints.keys().collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(status) = self.endpoint_status(name).await {
                out.push(status);
            }
        }
        out
    }

    /// Request metrics snapshot for all endpoints
    pub fn metrics_snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        self.metrics.snapshot_all()
    }
}
