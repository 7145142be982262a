use expool::Strategy;
use std::env;
use std::fs;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
endpoints:
  binance:
    rate_quota: 1200
    weight: 200
    timeout_ms: 5000
    pool_min: 2
    pool_max: 16
    idle_timeout_secs: 120
  kraken:
    rate_quota: 600
  okx:
    rate_quota: 300
    enabled: false

strategy: weighted_round_robin

circuit:
  failure_threshold: 4
  cooldown_secs: 20
  cooldown_backoff: 1.5
  max_cooldown_secs: 120

health:
  probe_interval_secs: 10
  probe_timeout_secs: 2
  score_floor: 0.25

rate:
  window_secs: 30
  low_multiplier: 0.2

borrow_timeout_ms: 500
default_request_timeout_ms: 8000
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = expool::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.endpoints.len(), 3);

    let binance = config.endpoints.get("binance").unwrap();
    assert_eq!(binance.rate_quota, 1200);
    assert_eq!(binance.weight, 200);
    assert_eq!(binance.timeout_ms, 5000);
    assert_eq!(binance.pool_min, 2);
    assert_eq!(binance.pool_max, 16);
    assert_eq!(binance.idle_timeout_secs, 120);
    assert!(binance.enabled);

    let okx = config.endpoints.get("okx").unwrap();
    assert!(!okx.enabled);

    assert_eq!(config.strategy, Strategy::WeightedRoundRobin);
    assert_eq!(config.circuit.failure_threshold, 4);
    assert_eq!(config.circuit.cooldown_secs, 20);
    assert_eq!(config.health.probe_interval_secs, 10);
    assert_eq!(config.health.score_floor, 0.25);
    assert_eq!(config.rate.window_secs, 30);
    assert_eq!(config.rate.low_multiplier, 0.2);
    assert_eq!(config.borrow_timeout_ms, 500);
    assert_eq!(config.default_request_timeout_ms, 8000);
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    // Save original env vars
    let orig_endpoints = env::var("EXPOOL_ENDPOINTS").ok();
    let orig_quota = env::var("EXPOOL_RATE_QUOTA").ok();
    let orig_strategy = env::var("EXPOOL_STRATEGY").ok();
    let orig_pool_max = env::var("EXPOOL_POOL_MAX").ok();
    let orig_floor = env::var("EXPOOL_SCORE_FLOOR").ok();

    // Set test env vars
    env::set_var("EXPOOL_ENDPOINTS", "binance, kraken ,okx");
    env::set_var("EXPOOL_RATE_QUOTA", "900");
    env::set_var("EXPOOL_STRATEGY", "least_latency");
    env::set_var("EXPOOL_POOL_MAX", "12");
    env::set_var("EXPOOL_SCORE_FLOOR", "0.4");

    let config = expool::config::load_from_env().unwrap();

    assert_eq!(config.endpoints.len(), 3);
    assert!(config.endpoints.contains_key("binance"));
    assert!(config.endpoints.contains_key("kraken"));
    assert!(config.endpoints.contains_key("okx"));

    let kraken = config.endpoints.get("kraken").unwrap();
    assert_eq!(kraken.rate_quota, 900);
    assert_eq!(kraken.pool_max, 12);

    assert_eq!(config.strategy, Strategy::LeastLatency);
    assert_eq!(config.health.score_floor, 0.4);

    // Restore original env vars
    cleanup_env("EXPOOL_ENDPOINTS", orig_endpoints);
    cleanup_env("EXPOOL_RATE_QUOTA", orig_quota);
    cleanup_env("EXPOOL_STRATEGY", orig_strategy);
    cleanup_env("EXPOOL_POOL_MAX", orig_pool_max);
    cleanup_env("EXPOOL_SCORE_FLOOR", orig_floor);
}

/// Test default values
#[test]
fn test_default_values() {
    let yaml = r#"
endpoints:
  minimal:
    rate_quota: 100
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = expool::config::load_from_yaml(&config_path).unwrap();

    let ep = config.endpoints.get("minimal").unwrap();
    assert_eq!(ep.weight, 100);
    assert!(ep.enabled);
    assert_eq!(ep.timeout_ms, 10_000);
    assert_eq!(ep.pool_min, 1);
    assert_eq!(ep.pool_max, 8);

    assert_eq!(config.strategy, Strategy::RoundRobin);
    assert_eq!(config.circuit.failure_threshold, 5);
    assert_eq!(config.circuit.cooldown_secs, 30);
    assert_eq!(config.health.probe_interval_secs, 30);
    assert_eq!(config.health.score_floor, 0.3);
    assert_eq!(config.rate.window_secs, 60);
    assert_eq!(config.rate.high_multiplier, 1.0);
    assert_eq!(config.rate.normal_multiplier, 0.6);
    assert_eq!(config.rate.low_multiplier, 0.3);
    assert_eq!(config.borrow_timeout_ms, 1_000);
    assert_eq!(config.max_admission_wait_ms, 500);
}

/// Test that invalid configurations are rejected at load time
#[test]
fn test_invalid_config_rejected() {
    let yaml = r#"
endpoints:
  broken:
    rate_quota: 100
    pool_min: 10
    pool_max: 2
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    assert!(expool::config::load_from_yaml(&config_path).is_err());
}

/// Test missing file error
#[test]
fn test_missing_file() {
    assert!(expool::config::load_from_yaml("/nonexistent/config.yaml").is_err());
}

/// Helper function to cleanup environment variables
fn cleanup_env(key: &str, orig_val: Option<String>) {
    match orig_val {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
