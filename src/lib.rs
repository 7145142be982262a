//! expool: multi-exchange connection and rate-limit management
//!
//! A library for routing API requests across several cryptocurrency exchange
//! endpoints while respecting each exchange's rate limits and tolerating
//! endpoint failures. The pieces compose into one orchestrator:
//!
//! - [`limit::RateLimiter`]: priority-aware token buckets per endpoint, with
//!   an optional distributed usage backend
//! - [`pool::CircuitBreaker`]: per-endpoint Closed/Open/HalfOpen breaker with
//!   cooldown backoff and single-trial recovery
//! - [`pool::ConnectionPool`]: bounded reusable sessions per endpoint with
//!   idle sweeping and failure eviction
//! - [`lb::HealthMonitor`]: active probes plus passive results, scored in [0,1]
//! - [`lb::LoadBalancer`]: five runtime-switchable candidate orderings
//! - [`manager::ExchangeManager`]: drives a request through circuit, rate
//!   limit, pool and call, failing over across candidates
//!
//! Exchange wire protocols stay out of scope: callers plug in one
//! [`client::ExchangeApi`] implementation per endpoint.
//!
//! ```no_run
//! use expool::config::Config;
//! use expool::manager::{ExchangeManager, RequestEnvelope};
//! use std::collections::HashMap;
//!
//! # async fn run(config: Config, clients: HashMap<String, std::sync::Arc<dyn expool::client::ExchangeApi>>) -> anyhow::Result<()> {
//! let manager = ExchangeManager::new(config, clients).await?;
//! manager.start().await;
//!
//! let ticker = manager
//!     .execute(RequestEnvelope::new("fetch_ticker").params(serde_json::json!({"symbol": "BTC/USDT"})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod lb;
pub mod limit;
pub mod manager;
pub mod metrics;
pub mod pool;

pub use client::{CallError, ExchangeApi};
pub use config::Config;
pub use lb::{HealthMonitor, LoadBalancer, Strategy};
pub use limit::{Admission, Priority, RateLimiter, SharedUsage};
pub use manager::{ExchangeManager, ExecuteError, RequestEnvelope};
pub use pool::{CircuitBreaker, CircuitState, ConnectionPool};
