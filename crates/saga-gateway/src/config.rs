//! Gateway configuration with JSON file deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start with [`GatewayConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `SAGA_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use saga_telemetry::LogFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Lower bound for the idle sweep period.
const MIN_SWEEP_INTERVAL_MS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

impl ConfigError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::InvalidValue(_) => "invalid_value",
        }
    }
}

/// Runtime configuration of one gateway process.
///
/// Every limit uses `0` for "no limit" (or "disabled" for the idle timeout).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub max_connections: usize,
    pub max_connections_per_origin: usize,
    pub max_subscriptions_per_client: usize,
    pub idle_timeout_ms: u64,
    /// Threshold for the advisory `idleClients` metric. Independent of eviction.
    pub idle_advisory_ms: u64,
    pub idle_sweep_interval_ms: u64,
    /// Most recent N persisted events replayed per catch-up.
    pub replay_limit: u32,
    pub replay_warn_threshold_ms: u64,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
    pub bus_capacity: usize,
    pub database_path: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4100,
            max_connections: 1000,
            max_connections_per_origin: 100,
            max_subscriptions_per_client: 10,
            idle_timeout_ms: 300_000,
            idle_advisory_ms: 60_000,
            idle_sweep_interval_ms: 1_000,
            replay_limit: 500,
            replay_warn_threshold_ms: 2_000,
            send_queue_capacity: 256,
            bus_capacity: 1024,
            database_path: default_database_path().to_string_lossy().into_owned(),
            log_level: "info".into(),
            log_format: LogFormat::Json,
        }
    }
}

impl GatewayConfig {
    /// `None` when eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// `None` when the advisory metric is disabled.
    pub fn idle_advisory(&self) -> Option<Duration> {
        (self.idle_advisory_ms > 0).then(|| Duration::from_millis(self.idle_advisory_ms))
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms.max(MIN_SWEEP_INTERVAL_MS))
    }

    pub fn replay_warn_threshold(&self) -> Duration {
        Duration::from_millis(self.replay_warn_threshold_ms)
    }

    /// `None` when replay is unbounded.
    pub fn replay_limit(&self) -> Option<u32> {
        (self.replay_limit > 0).then_some(self.replay_limit)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values that would leave the gateway unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("sendQueueCapacity must be > 0".into()));
        }
        if self.bus_capacity == 0 {
            return Err(ConfigError::InvalidValue("busCapacity must be > 0".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        Ok(())
    }

    /// Load from an optional JSON file, then apply environment overrides.
    ///
    /// A missing file yields defaults. Invalid JSON is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading gateway config from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            Some(path) => {
                debug!(?path, "config file not found, using defaults");
                defaults
            }
            None => defaults,
        };

        let mut config: Self = serde_json::from_value(merged)?;
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }
}

fn default_database_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".saga").join("gateway.db")
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SAGA_*` overrides. Unparsable values are ignored with a warning.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Some(v) = read_env_string("SAGA_HOST") {
        config.host = v;
    }
    if let Some(v) = read_env_parsed::<u16>("SAGA_PORT") {
        config.port = v;
    }
    if let Some(v) = read_env_parsed::<usize>("SAGA_MAX_CONNECTIONS") {
        config.max_connections = v;
    }
    if let Some(v) = read_env_parsed::<usize>("SAGA_MAX_CONNECTIONS_PER_ORIGIN") {
        config.max_connections_per_origin = v;
    }
    if let Some(v) = read_env_parsed::<usize>("SAGA_MAX_SUBSCRIPTIONS_PER_CLIENT") {
        config.max_subscriptions_per_client = v;
    }
    if let Some(v) = read_env_parsed::<u64>("SAGA_IDLE_TIMEOUT_MS") {
        config.idle_timeout_ms = v;
    }
    if let Some(v) = read_env_parsed::<u64>("SAGA_IDLE_ADVISORY_MS") {
        config.idle_advisory_ms = v;
    }
    if let Some(v) = read_env_parsed::<u32>("SAGA_REPLAY_LIMIT") {
        config.replay_limit = v;
    }
    if let Some(v) = read_env_string("SAGA_DATABASE_PATH") {
        config.database_path = v;
    }
    if let Some(v) = read_env_string("SAGA_LOG_LEVEL") {
        config.log_level = v;
    }
}

/// Parse an unsigned number, tolerating surrounding whitespace.
pub fn parse_number<T: std::str::FromStr>(val: &str) -> Option<T> {
    val.trim().parse().ok()
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = parse_number(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}
