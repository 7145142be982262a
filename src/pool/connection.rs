//! Per-endpoint connection pooling
//!
//! Each endpoint owns a bounded set of reusable sessions. Borrowing blocks up
//! to a configured timeout when the pool is at capacity (surfacing
//! `PoolError::Exhausted`, never hanging), idle sessions beyond a minimum are
//! swept on a background schedule, and sessions failing repeatedly are evicted
//! rather than returned to the idle set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Error types for connection pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted for endpoint: {0}")]
    Exhausted(String),

    #[error("endpoint not registered: {0}")]
    EndpointNotFound(String),

    #[error("pool is shut down")]
    Shutdown,
}

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Degraded,
    Failed,
    Closed,
}

/// Configuration for one endpoint's pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections (idle + in-use) per endpoint
    pub max_connections: usize,

    /// Minimum idle connections kept warm; created eagerly at registration
    pub min_connections: usize,

    /// Maximum idle time before a connection is swept
    pub idle_timeout: Duration,

    /// How long a borrow waits for capacity before failing
    pub borrow_timeout: Duration,

    /// Consecutive operation failures before a connection is evicted
    pub failure_eviction_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 1,
            idle_timeout: Duration::from_secs(90),
            borrow_timeout: Duration::from_secs(1),
            failure_eviction_threshold: 3,
        }
    }
}

/// Statistics for one endpoint's pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_reused: u64,
    pub total_evicted: u64,
    pub borrow_timeouts: u64,
    pub in_use: usize,
    pub idle: usize,
    pub max_connections: usize,
}

/// One live session against an exchange endpoint
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub endpoint: String,
    status: ConnectionStatus,
    last_used: Instant,
    latency_ewma_ms: f64,
    consecutive_failures: u32,
    use_count: u64,
}

const LATENCY_EWMA_ALPHA: f64 = 0.3;

impl Connection {
    fn new(id: u64, endpoint: String) -> Self {
        Self {
            id,
            endpoint,
            status: ConnectionStatus::Connecting,
            last_used: Instant::now(),
            latency_ewma_ms: 0.0,
            consecutive_failures: 0,
            use_count: 0,
        }
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
        self.status = ConnectionStatus::Active;
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() >= idle_timeout
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Exponentially weighted latency estimate in milliseconds
    pub fn latency_ewma_ms(&self) -> f64 {
        self.latency_ewma_ms
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_success(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_ewma_ms = if self.use_count <= 1 {
            ms
        } else {
            LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * self.latency_ewma_ms
        };
        self.consecutive_failures = 0;
        self.status = ConnectionStatus::Active;
    }

    fn record_failure(&mut self, eviction_threshold: u32) {
        self.consecutive_failures += 1;
        self.status = if self.consecutive_failures >= eviction_threshold {
            ConnectionStatus::Failed
        } else {
            ConnectionStatus::Degraded
        };
    }
}

/// A borrowed connection. Exclusively owned by the borrower until handed back
/// with [`ConnectionPool::give_back`]; dropping it without a give-back releases
/// the capacity slot and discards the session, so a request that dies mid-call
/// can never leave a connection checked out.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    endpoint: String,
    permit: Option<OwnedSemaphorePermit>,
    /// Eviction threshold copied from the owning pool's config at borrow time
    eviction_threshold: u32,
    /// Checked-out counter shared with the owning pool entry
    checked_out: Arc<AtomicUsize>,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or(0)
    }

    /// Record a successful operation and its observed latency
    pub fn mark_success(&mut self, latency: Duration) {
        if let Some(conn) = self.conn.as_mut() {
            conn.record_success(latency);
        }
    }

    /// Record a failed operation
    pub fn mark_failure(&mut self) {
        let threshold = self.eviction_threshold;
        if let Some(conn) = self.conn.as_mut() {
            conn.record_failure(threshold);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A guard dropped without give_back discards its session; the permit
        // drop frees capacity, this frees the checked-out count
        if self.conn.is_some() {
            self.checked_out.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Pool state for a single endpoint
struct EndpointPool {
    endpoint: String,
    idle: Vec<Connection>,
    config: PoolConfig,
    next_id: u64,
    total_created: u64,
    total_reused: u64,
    total_evicted: u64,
    borrow_timeouts: u64,
    closed: bool,
}

impl EndpointPool {
    fn new(endpoint: String, config: PoolConfig) -> Self {
        Self {
            endpoint,
            idle: Vec::with_capacity(config.max_connections),
            config,
            next_id: 0,
            total_created: 0,
            total_reused: 0,
            total_evicted: 0,
            borrow_timeouts: 0,
            closed: false,
        }
    }

    fn create_connection(&mut self) -> Connection {
        self.next_id += 1;
        self.total_created += 1;
        debug!(
            endpoint = %self.endpoint,
            id = self.next_id,
            total_created = self.total_created,
            "creating connection"
        );
        Connection::new(self.next_id, self.endpoint.clone())
    }

    /// Pop a usable idle connection, discarding expired ones along the way
    fn take_idle(&mut self) -> Option<Connection> {
        while let Some(mut conn) = self.idle.pop() {
            if conn.is_expired(self.config.idle_timeout) {
                debug!(endpoint = %self.endpoint, id = conn.id, "discarding expired idle connection");
                self.total_evicted += 1;
                continue;
            }
            conn.mark_used();
            self.total_reused += 1;
            return Some(conn);
        }
        None
    }

    /// Sweep expired idle connections, keeping at least `min_connections`
    fn sweep(&mut self) {
        let min = self.config.min_connections;
        let before = self.idle.len();
        while self.idle.len() > min {
            // Oldest entries sit at the front
            match self.idle.first() {
                Some(conn) if conn.is_expired(self.config.idle_timeout) => {
                    let conn = self.idle.remove(0);
                    debug!(endpoint = %self.endpoint, id = conn.id, "sweeping idle connection");
                    self.total_evicted += 1;
                }
                _ => break,
            }
        }
        let removed = before - self.idle.len();
        if removed > 0 {
            debug!(
                endpoint = %self.endpoint,
                removed = removed,
                remaining = self.idle.len(),
                "idle sweep completed"
            );
        }
    }
}

/// Per-endpoint pool entry: capacity semaphore + guarded state.
///
/// The semaphore bounds borrowed connections; sessions are only created while
/// a permit is held and the idle list is empty, which keeps
/// `in_use + idle <= max_connections` at every observation point.
struct PoolEntry {
    semaphore: Arc<Semaphore>,
    inner: Mutex<EndpointPool>,
    max_connections: usize,
    /// Connections currently handed out. Mutated only while `inner` is held
    /// (except the lock-free decrement on guard drop), so a stats reader
    /// holding `inner` sees it consistent with the idle list.
    checked_out: Arc<AtomicUsize>,
}

/// Connection pool manager for all endpoints
pub struct ConnectionPool {
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    sweep_interval: Duration,
}

impl ConnectionPool {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            sweep_interval,
        }
    }

    /// Register an endpoint, warming `min_connections` sessions eagerly
    pub async fn register(&self, endpoint: &str, config: PoolConfig) {
        let mut pools = self.pools.write().await;
        if pools.contains_key(endpoint) {
            return;
        }
        info!(
            endpoint = %endpoint,
            max = config.max_connections,
            min = config.min_connections,
            "registering endpoint pool"
        );
        let max = config.max_connections.max(1);
        let mut pool = EndpointPool::new(endpoint.to_string(), config.clone());
        for _ in 0..config.min_connections.min(max) {
            let mut conn = pool.create_connection();
            conn.status = ConnectionStatus::Active;
            pool.idle.push(conn);
        }
        pools.insert(
            endpoint.to_string(),
            Arc::new(PoolEntry {
                semaphore: Arc::new(Semaphore::new(max)),
                inner: Mutex::new(pool),
                max_connections: max,
                checked_out: Arc::new(AtomicUsize::new(0)),
            }),
        );
    }

    async fn entry(&self, endpoint: &str) -> Option<Arc<PoolEntry>> {
        self.pools.read().await.get(endpoint).cloned()
    }

    /// Borrow a connection, waiting up to the endpoint's configured borrow
    /// timeout for capacity.
    pub async fn borrow(&self, endpoint: &str) -> Result<PooledConnection, PoolError> {
        let entry = self
            .entry(endpoint)
            .await
            .ok_or_else(|| PoolError::EndpointNotFound(endpoint.to_string()))?;
        let timeout = entry.inner.lock().await.config.borrow_timeout;
        self.borrow_with_timeout(endpoint, timeout).await
    }

    /// Borrow with an explicit capacity wait bound (used by the orchestrator
    /// to cap the wait at the request deadline).
    pub async fn borrow_with_timeout(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        let entry = self
            .entry(endpoint)
            .await
            .ok_or_else(|| PoolError::EndpointNotFound(endpoint.to_string()))?;

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&entry.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Shutdown),
            Err(_) => {
                let mut pool = entry.inner.lock().await;
                pool.borrow_timeouts += 1;
                warn!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "borrow timed out");
                return Err(PoolError::Exhausted(endpoint.to_string()));
            }
        };

        let mut pool = entry.inner.lock().await;
        if pool.closed {
            return Err(PoolError::Shutdown);
        }
        let conn = match pool.take_idle() {
            Some(conn) => conn,
            None => {
                let mut conn = pool.create_connection();
                conn.mark_used();
                conn
            }
        };
        // Counted as checked out only once the session leaves the idle set,
        // while the pool lock is held
        entry.checked_out.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            endpoint: endpoint.to_string(),
            conn: Some(conn),
            permit: Some(permit),
            eviction_threshold: pool.config.failure_eviction_threshold,
            checked_out: Arc::clone(&entry.checked_out),
        })
    }

    /// Return a borrowed connection. Sessions at the failure-eviction
    /// threshold are destroyed instead of re-entering the idle set; the pool
    /// creates a replacement on next demand.
    pub async fn give_back(&self, mut borrowed: PooledConnection) {
        let Some(conn) = borrowed.conn.take() else {
            return;
        };
        let Some(entry) = self.entry(&borrowed.endpoint).await else {
            borrowed.checked_out.fetch_sub(1, Ordering::Relaxed);
            return;
        };

        let mut pool = entry.inner.lock().await;
        // Release capacity and the checked-out count while holding the pool
        // lock so observers never see the connection counted as both in-use
        // and idle.
        borrowed.checked_out.fetch_sub(1, Ordering::Relaxed);
        drop(borrowed.permit.take());

        if pool.closed {
            return;
        }
        if conn.status == ConnectionStatus::Failed
            || conn.consecutive_failures >= pool.config.failure_eviction_threshold
        {
            pool.total_evicted += 1;
            info!(
                endpoint = %pool.endpoint,
                id = conn.id,
                failures = conn.consecutive_failures,
                "evicting failed connection"
            );
            return;
        }
        pool.idle.push(conn);
    }

    /// Statistics for one endpoint's pool
    pub async fn stats(&self, endpoint: &str) -> Option<PoolStats> {
        let entry = self.entry(endpoint).await?;
        let pool = entry.inner.lock().await;
        Some(PoolStats {
            total_created: pool.total_created,
            total_reused: pool.total_reused,
            total_evicted: pool.total_evicted,
            borrow_timeouts: pool.borrow_timeouts,
            // Permit arithmetic would also count borrowers that hold a permit
            // but have not yet taken a session out of the idle set
            in_use: entry.checked_out.load(Ordering::Relaxed),
            idle: pool.idle.len(),
            max_connections: entry.max_connections,
        })
    }

    /// Statistics for all endpoint pools
    pub async fn all_stats(&self) -> HashMap<String, PoolStats> {
        let names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        let mut out = HashMap::new();
        for name in names {
            if let Some(stats) = self.stats(&name).await {
                out.insert(name, stats);
            }
        }
        out
    }

    /// Spawn the background idle sweep task
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = pool.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.sweep_all().await;
            }
        })
    }

    /// Sweep expired idle connections across all endpoints
    pub async fn sweep_all(&self) {
        let entries: Vec<Arc<PoolEntry>> = self.pools.read().await.values().cloned().collect();
        for entry in entries {
            entry.inner.lock().await.sweep();
        }
    }

    /// Close all pools: idle connections are dropped and pending/future
    /// borrows fail with `PoolError::Shutdown`.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<PoolEntry>> = self.pools.read().await.values().cloned().collect();
        for entry in entries {
            let mut pool = entry.inner.lock().await;
            pool.closed = true;
            let dropped = pool.idle.len();
            pool.idle.clear();
            entry.semaphore.close();
            if dropped > 0 {
                info!(endpoint = %pool.endpoint, dropped = dropped, "pool shut down");
            }
        }
    }

    /// Remove an endpoint's pool entirely
    pub async fn remove(&self, endpoint: &str) {
        let mut pools = self.pools.write().await;
        if pools.remove(endpoint).is_some() {
            info!(endpoint = %endpoint, "removed endpoint pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_connections: 2,
            min_connections: 0,
            idle_timeout: Duration::from_secs(60),
            borrow_timeout: Duration::from_millis(50),
            failure_eviction_threshold: 2,
        }
    }

    #[tokio::test]
    async fn test_borrow_and_give_back() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;

        let conn = pool.borrow("binance").await.unwrap();
        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 0);

        pool.give_back(conn).await;
        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;

        let conn = pool.borrow("binance").await.unwrap();
        let first_id = conn.id();
        pool.give_back(conn).await;

        let conn = pool.borrow("binance").await.unwrap();
        assert_eq!(conn.id(), first_id);
        pool.give_back(conn).await;

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 1);
    }

    #[tokio::test]
    async fn test_borrow_timeout_surfaces_exhausted() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;

        let _a = pool.borrow("binance").await.unwrap();
        let _b = pool.borrow("binance").await.unwrap();

        let err = pool.borrow("binance").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.borrow_timeouts, 1);
    }

    #[tokio::test]
    async fn test_drop_without_give_back_releases_capacity() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;

        {
            let _a = pool.borrow("binance").await.unwrap();
            let _b = pool.borrow("binance").await.unwrap();
        }
        // Both guards dropped; capacity is available again
        let conn = pool.borrow("binance").await.unwrap();
        pool.give_back(conn).await;
    }

    #[tokio::test]
    async fn test_failed_connection_evicted() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;

        let mut conn = pool.borrow("binance").await.unwrap();
        let first_id = conn.id();
        conn.mark_failure();
        conn.mark_failure();
        pool.give_back(conn).await;

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_evicted, 1);

        // Replacement created transparently on next demand
        let conn = pool.borrow("binance").await.unwrap();
        assert_ne!(conn.id(), first_id);
        pool.give_back(conn).await;
    }

    #[tokio::test]
    async fn test_pool_size_invariant_under_concurrency() {
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(60)));
        let config = PoolConfig {
            max_connections: 4,
            borrow_timeout: Duration::from_millis(200),
            ..small_config()
        };
        pool.register("binance", config).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if let Ok(conn) = pool.borrow("binance").await {
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        pool.give_back(conn).await;
                    }
                    let stats = pool.stats("binance").await.unwrap();
                    assert!(
                        stats.in_use + stats.idle <= stats.max_connections,
                        "in_use={} idle={} max={}",
                        stats.in_use,
                        stats.idle,
                        stats.max_connections
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_eviction_threshold_taken_from_pool_config() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let config = PoolConfig {
            failure_eviction_threshold: 1,
            ..small_config()
        };
        pool.register("binance", config).await;

        // One failure is enough at this pool's configured threshold
        let mut conn = pool.borrow("binance").await.unwrap();
        conn.mark_failure();
        pool.give_back(conn).await;

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_evicted, 1);
    }

    #[tokio::test]
    async fn test_stats_consistent_while_borrows_contend() {
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(60)));
        let config = PoolConfig {
            min_connections: 4,
            max_connections: 4,
            borrow_timeout: Duration::from_millis(200),
            ..small_config()
        };
        pool.register("binance", config).await;

        // Workers churn the pool while the main task keeps observing stats;
        // a borrower between permit acquisition and taking a session must
        // never be double-counted against the idle list
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if let Ok(conn) = pool.borrow("binance").await {
                        tokio::task::yield_now().await;
                        pool.give_back(conn).await;
                    }
                }
            }));
        }

        let mut done = 0;
        while done < handles.len() {
            done = handles.iter().filter(|h| h.is_finished()).count();
            let stats = pool.stats("binance").await.unwrap();
            assert!(
                stats.in_use + stats.idle <= stats.max_connections,
                "observed in_use={} idle={} > max={}",
                stats.in_use,
                stats.idle,
                stats.max_connections
            );
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_min_connections_warmed() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let config = PoolConfig {
            min_connections: 2,
            max_connections: 4,
            ..small_config()
        };
        pool.register("binance", config).await;

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total_created, 2);
    }

    #[tokio::test]
    async fn test_sweep_respects_minimum() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let config = PoolConfig {
            min_connections: 1,
            max_connections: 4,
            idle_timeout: Duration::from_millis(10),
            ..small_config()
        };
        pool.register("binance", config).await;

        // Three idle connections
        let a = pool.borrow("binance").await.unwrap();
        let b = pool.borrow("binance").await.unwrap();
        let c = pool.borrow("binance").await.unwrap();
        pool.give_back(a).await;
        pool.give_back(b).await;
        pool.give_back(c).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.sweep_all().await;

        let stats = pool.stats("binance").await.unwrap();
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_borrows() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        pool.register("binance", small_config()).await;
        pool.shutdown().await;

        let err = pool.borrow("binance").await.unwrap_err();
        assert!(matches!(err, PoolError::Shutdown));
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let err = pool.borrow("nope").await.unwrap_err();
        assert!(matches!(err, PoolError::EndpointNotFound(_)));
    }
}
