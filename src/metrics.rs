//! Per-endpoint request metrics
//!
//! Lock-free counters plus a fixed-bucket latency histogram, snapshotted on
//! demand for an external observability collaborator. Circuit transition
//! counts live in the breaker's own stats; pool utilization in the pool's.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Upper bucket bounds in milliseconds; one overflow bucket follows
const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Fixed-bucket latency histogram
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&le| ms <= le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: LATENCY_BUCKETS_MS
                .iter()
                .enumerate()
                .map(|(i, &le)| (le, self.buckets[i].load(Ordering::Relaxed)))
                .collect(),
            overflow: self.buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time histogram view: (upper bound ms, count) pairs
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<(u64, u64)>,
    pub overflow: u64,
    pub count: u64,
    pub sum_ms: u64,
}

/// Counters for one endpoint
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub admission_rejections: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub pool_exhaustions: AtomicU64,
    pub latency: LatencyHistogram,
}

impl EndpointMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            pool_exhaustions: self.pool_exhaustions.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Serializable point-in-time metrics for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub admission_rejections: u64,
    pub circuit_rejections: u64,
    pub pool_exhaustions: u64,
    pub latency: HistogramSnapshot,
}

/// Registry of per-endpoint metrics. Writes to the map happen only at
/// registration; the hot path takes a read lock and bumps atomics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    endpoints: RwLock<HashMap<String, Arc<EndpointMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: &str) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(EndpointMetrics::default()));
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<EndpointMetrics>> {
        self.endpoints
            .read()
            .ok()
            .and_then(|endpoints| endpoints.get(endpoint).cloned())
    }

    pub fn snapshot_all(&self) -> HashMap<String, MetricsSnapshot> {
        match self.endpoints.read() {
            Ok(endpoints) => endpoints
                .iter()
                .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }
}
