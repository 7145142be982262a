//! Priority-aware rate limiting
//!
//! One token bucket per (endpoint, priority class). Each class gets its own
//! bucket sized by a priority multiplier over the endpoint's configured quota,
//! so High traffic is never starved by Low traffic. Denials carry a wait hint
//! derived from the bucket's refill rate so callers can back off instead of
//! busy-polling.
//!
//! An optional shared-usage backend lets multiple process instances pool their
//! consumption accounting. The backend is an external collaborator: when it
//! errors, the limiter degrades to local-only accounting and keeps serving.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Caller-declared importance tier for rate-limit admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Denied; the caller should wait at least this long before retrying
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LimitError {
    #[error("endpoint not registered: {0}")]
    EndpointNotFound(String),
}

/// Shared consumption counter for running several manager instances against
/// the same exchange quotas (external collaborator).
#[async_trait]
pub trait SharedUsage: Send + Sync {
    /// Attempt to consume one request slot; `Ok(false)` means over quota.
    async fn try_consume(&self, endpoint: &str, priority: Priority)
        -> Result<bool, SharedUsageError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("shared usage backend error: {0}")]
pub struct SharedUsageError(pub String);

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Rolling window the per-endpoint quota applies to
    pub window: Duration,

    /// Effective-quota multipliers per class; higher classes get larger buckets
    pub high_multiplier: f64,
    pub normal_multiplier: f64,
    pub low_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            high_multiplier: 1.0,
            normal_multiplier: 0.6,
            low_multiplier: 0.3,
        }
    }
}

impl RateLimitConfig {
    fn multiplier(&self, priority: Priority) -> f64 {
        match priority {
            Priority::High => self.high_multiplier,
            Priority::Normal => self.normal_multiplier,
            Priority::Low => self.low_multiplier,
        }
    }
}

/// Token bucket: capacity tokens, refilled continuously at `refill_per_sec`
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Configured rate window, used as the hint when nothing ever refills
    window: Duration,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64, window: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            window,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_acquire(&mut self) -> Admission {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Admission::Granted
        } else {
            Admission::Denied {
                retry_after: self.wait_hint(),
            }
        }
    }

    /// Time until one token will be available at the current refill rate
    fn wait_hint(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            // Zero quota never refills; hint one full window
            return self.window;
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    /// Debit a token without an admission decision (shared backend granted)
    fn consume_unchecked(&mut self) {
        self.refill(Instant::now());
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

/// One bucket per priority class
struct EndpointBuckets {
    buckets: [Bucket; 3],
}

impl EndpointBuckets {
    fn new(quota_per_window: u32, config: &RateLimitConfig) -> Self {
        let window_secs = config.window.as_secs_f64().max(0.001);
        let mk = |priority: Priority| {
            let effective = quota_per_window as f64 * config.multiplier(priority);
            Bucket::new(effective, effective / window_secs, config.window)
        };
        Self {
            buckets: [
                mk(Priority::High),
                mk(Priority::Normal),
                mk(Priority::Low),
            ],
        }
    }

    fn bucket_mut(&mut self, priority: Priority) -> &mut Bucket {
        &mut self.buckets[priority.index()]
    }
}

/// Rate limiter for all endpoints.
///
/// The outer map is only write-locked at registration; admission takes a read
/// lock plus the per-endpoint mutex, so endpoints never serialize each other.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<EndpointBuckets>>>>,
    config: RateLimitConfig,
    shared: Option<Arc<dyn SharedUsage>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            config,
            shared: None,
        }
    }

    /// Attach a distributed consumption backend
    pub fn with_shared(mut self, shared: Arc<dyn SharedUsage>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Register an endpoint with its per-window quota
    pub async fn register(&self, endpoint: &str, quota_per_window: u32) {
        let mut buckets = self.buckets.write().await;
        if !buckets.contains_key(endpoint) {
            debug!(endpoint = %endpoint, quota = quota_per_window, "registering endpoint with rate limiter");
            buckets.insert(
                endpoint.to_string(),
                Arc::new(Mutex::new(EndpointBuckets::new(
                    quota_per_window,
                    &self.config,
                ))),
            );
        }
    }

    /// Admission check for one request against (endpoint, priority).
    ///
    /// With a shared backend attached its verdict wins; the local bucket is
    /// still debited on grants so wait hints stay meaningful. Backend errors
    /// degrade to local-only limiting.
    pub async fn acquire(&self, endpoint: &str, priority: Priority) -> Result<Admission, LimitError> {
        let entry = self
            .buckets
            .read()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| LimitError::EndpointNotFound(endpoint.to_string()))?;

        if let Some(shared) = &self.shared {
            match shared.try_consume(endpoint, priority).await {
                Ok(true) => {
                    let mut buckets = entry.lock().await;
                    buckets.bucket_mut(priority).consume_unchecked();
                    return Ok(Admission::Granted);
                }
                Ok(false) => {
                    let mut buckets = entry.lock().await;
                    let bucket = buckets.bucket_mut(priority);
                    bucket.refill(Instant::now());
                    return Ok(Admission::Denied {
                        retry_after: bucket.wait_hint(),
                    });
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "shared usage backend unavailable, falling back to local limiting");
                }
            }
        }

        let mut buckets = entry.lock().await;
        Ok(buckets.bucket_mut(priority).try_acquire())
    }

    /// Remove an endpoint's buckets
    pub async fn remove(&self, endpoint: &str) {
        self.buckets.write().await.remove(endpoint);
    }
}
