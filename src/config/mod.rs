use crate::lb::Strategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Per-endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Static weight for weighted strategies and tie-breaking
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Whether the endpoint participates in balancing at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rate limit quota: requests allowed per rate window at high priority
    pub rate_quota: u32,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Minimum connections kept warm in the pool
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    /// Maximum connections in the pool
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// Idle connections older than this are swept
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_weight() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    8
}

fn default_idle_timeout_secs() -> u64 {
    90
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Base cooldown in seconds before a half-open trial
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cooldown multiplier applied on each re-open
    #[serde(default = "default_cooldown_backoff")]
    pub cooldown_backoff: f64,

    /// Cooldown ceiling in seconds
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_cooldown_backoff() -> f64 {
    2.0
}

fn default_max_cooldown_secs() -> u64 {
    300
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_backoff: default_cooldown_backoff(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

/// Health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between active probes per endpoint
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Endpoints scoring below this are excluded from candidate sets
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_score_floor() -> f64 {
    0.3
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            score_floor: default_score_floor(),
        }
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSettings {
    /// Length of the rate window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Share of the quota available to high-priority requests
    #[serde(default = "default_high_multiplier")]
    pub high_multiplier: f64,

    /// Share of the quota available to normal-priority requests
    #[serde(default = "default_normal_multiplier")]
    pub normal_multiplier: f64,

    /// Share of the quota available to low-priority requests
    #[serde(default = "default_low_multiplier")]
    pub low_multiplier: f64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_high_multiplier() -> f64 {
    1.0
}

fn default_normal_multiplier() -> f64 {
    0.6
}

fn default_low_multiplier() -> f64 {
    0.3
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            high_multiplier: default_high_multiplier(),
            normal_multiplier: default_normal_multiplier(),
            low_multiplier: default_low_multiplier(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named exchange endpoints
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Load balancing strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthSettings,

    /// Rate limiter settings
    #[serde(default)]
    pub rate: RateSettings,

    /// Pool borrow timeout in milliseconds
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,

    /// Default request deadline in milliseconds when the caller gives none
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,

    /// Longest the orchestrator will sleep waiting for rate limit capacity
    #[serde(default = "default_max_admission_wait_ms")]
    pub max_admission_wait_ms: u64,

    /// Idle-connection sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_borrow_timeout_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_admission_wait_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
            strategy: Strategy::default(),
            circuit: CircuitConfig::default(),
            health: HealthSettings::default(),
            rate: RateSettings::default(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
            default_request_timeout_ms: default_request_timeout_ms(),
            max_admission_wait_ms: default_max_admission_wait_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn max_admission_wait(&self) -> Duration {
        Duration::from_millis(self.max_admission_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("configuration contains no endpoints");
        }
        for (name, ep) in &self.endpoints {
            if ep.rate_quota == 0 {
                anyhow::bail!("endpoint '{}' has a zero rate quota", name);
            }
            if ep.pool_max == 0 {
                anyhow::bail!("endpoint '{}' has a zero pool size", name);
            }
            if ep.pool_min > ep.pool_max {
                anyhow::bail!(
                    "endpoint '{}': pool_min {} exceeds pool_max {}",
                    name,
                    ep.pool_min,
                    ep.pool_max
                );
            }
        }
        if !(0.0..=1.0).contains(&self.health.score_floor) {
            anyhow::bail!("health.score_floor must be in [0,1]");
        }
        if self.circuit.cooldown_backoff < 1.0 {
            anyhow::bail!("circuit.cooldown_backoff must be >= 1.0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables:
/// - EXPOOL_ENDPOINTS (comma-separated endpoint names, required)
/// - EXPOOL_RATE_QUOTA (requests per window, shared by all endpoints)
/// - EXPOOL_STRATEGY (round_robin, weighted_round_robin, least_latency,
///   least_connections, failover)
/// - EXPOOL_POOL_MAX / EXPOOL_POOL_MIN
/// - EXPOOL_TIMEOUT_MS (per-request timeout)
/// - EXPOOL_SCORE_FLOOR
pub fn load_from_env() -> Result<Config> {
    // Load .env if present, ignore if missing
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let endpoints_str =
        std::env::var("EXPOOL_ENDPOINTS").context("EXPOOL_ENDPOINTS environment variable not set")?;

    let names: Vec<String> = endpoints_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if names.is_empty() {
        anyhow::bail!("EXPOOL_ENDPOINTS contains no valid endpoint names");
    }

    let rate_quota: u32 = match std::env::var("EXPOOL_RATE_QUOTA") {
        Ok(raw) => raw
            .parse()
            .context("EXPOOL_RATE_QUOTA is not a valid integer")?,
        Err(_) => 600,
    };

    let mut endpoint = EndpointConfig {
        weight: default_weight(),
        enabled: true,
        rate_quota,
        timeout_ms: default_timeout_ms(),
        pool_min: default_pool_min(),
        pool_max: default_pool_max(),
        idle_timeout_secs: default_idle_timeout_secs(),
    };

    if let Ok(raw) = std::env::var("EXPOOL_POOL_MAX") {
        if let Ok(val) = raw.parse() {
            endpoint.pool_max = val;
        }
    }

    if let Ok(raw) = std::env::var("EXPOOL_POOL_MIN") {
        if let Ok(val) = raw.parse() {
            endpoint.pool_min = val;
        }
    }

    if let Ok(raw) = std::env::var("EXPOOL_TIMEOUT_MS") {
        if let Ok(val) = raw.parse() {
            endpoint.timeout_ms = val;
        }
    }

    for name in names {
        config.endpoints.insert(name, endpoint.clone());
    }

    if let Ok(raw) = std::env::var("EXPOOL_STRATEGY") {
        config.strategy = serde_yaml::from_str(&raw)
            .context(format!("EXPOOL_STRATEGY '{}' is not a known strategy", raw))?;
    }

    if let Ok(raw) = std::env::var("EXPOOL_SCORE_FLOOR") {
        if let Ok(val) = raw.parse() {
            config.health.score_floor = val;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
endpoints:
  binance:
    rate_quota: 1200
    weight: 200
    timeout_ms: 5000
    pool_max: 16
  kraken:
    rate_quota: 600

strategy: least_latency

circuit:
  failure_threshold: 3
  cooldown_secs: 10

health:
  probe_interval_secs: 15
  score_floor: 0.4
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.endpoints.len(), 2);
        let binance = config.endpoints.get("binance").unwrap();
        assert_eq!(binance.rate_quota, 1200);
        assert_eq!(binance.weight, 200);
        assert_eq!(binance.pool_max, 16);

        assert_eq!(config.strategy, Strategy::LeastLatency);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.health.score_floor, 0.4);
    }

    #[test]
    fn test_default_values() {
        let yaml = r#"
endpoints:
  minimal:
    rate_quota: 100
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let ep = config.endpoints.get("minimal").unwrap();

        assert!(ep.enabled);
        assert_eq!(ep.weight, 100);
        assert_eq!(ep.pool_max, 8);
        assert_eq!(config.strategy, Strategy::RoundRobin);
        assert_eq!(config.rate.window_secs, 60);
        assert_eq!(config.borrow_timeout_ms, 1_000);
    }

    #[test]
    fn test_validate_rejects_bad_pool_bounds() {
        let yaml = r#"
endpoints:
  broken:
    rate_quota: 100
    pool_min: 9
    pool_max: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let yaml = r#"
endpoints:
  broken:
    rate_quota: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(Config::new().validate().is_err());
    }
}
