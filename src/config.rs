//! Static configuration for the three backend services.
//!
//! `jmylchreest-m3u-proxy`'s `Config` loads TOML through `figment`; that
//! crate isn't part of this crate's dependency stack, so configuration here
//! is loaded the plainer way the teacher's own tests configure components:
//! a `serde`-derived struct parsed with `toml::from_str`, with `FABRIC_*`
//! environment variables applied afterward as point overrides.

use crate::backoff::Backoff;
use crate::circuit_breaker::BreakerConfig;
use crate::error::FailureCode;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment override {var}={value}: {reason}")]
    BadEnvOverride { var: String, value: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub reset_timeout_ms: u64,
    pub half_open_max_concurrent: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            half_open_max_concurrent: defaults.half_open_max_concurrent,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            half_open_max_concurrent: self.half_open_max_concurrent,
            breaker_tripping: FailureCode::default_breaker_tripping().iter().copied().collect::<HashSet<_>>(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 100, max_backoff_ms: 5_000, multiplier: 2.0, jitter: 0.2 }
    }
}

impl RetrySettings {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        let backoff = Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            self.multiplier,
            Duration::from_millis(self.max_backoff_ms),
        );
        RetryPolicy::new(self.max_attempts, backoff, self.jitter)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    pub adaptive_enabled: bool,
    pub window_size: usize,
    pub percentile: u8,
    pub adjustment_factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub global_default_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            adaptive_enabled: defaults.adaptive_enabled,
            window_size: defaults.window_size,
            percentile: defaults.percentile,
            adjustment_factor: defaults.adjustment_factor,
            min_timeout_ms: defaults.min_timeout.as_millis() as u64,
            max_timeout_ms: defaults.max_timeout.as_millis() as u64,
            global_default_ms: defaults.global_default.as_millis() as u64,
        }
    }
}

impl TimeoutSettings {
    pub fn to_timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            adaptive_enabled: self.adaptive_enabled,
            window_size: self.window_size,
            percentile: self.percentile,
            adjustment_factor: self.adjustment_factor,
            min_timeout: Duration::from_millis(self.min_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            global_default: Duration::from_millis(self.global_default_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub max_idle_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            min_size: defaults.min_size,
            max_size: defaults.max_size,
            acquire_timeout_ms: defaults.acquire_timeout.as_millis() as u64,
            max_idle_ms: defaults.max_idle.as_millis() as u64,
            health_check_interval_ms: defaults.health_check_interval.as_millis() as u64,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            max_idle: Duration::from_millis(self.max_idle_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Top-level configuration: one `ServiceConfig` per backend service, bound
/// to a contiguous port range on loopback by default, per spec.md §6
/// ("Worker services bind three ports in contiguous ranges... Host defaults
/// to loopback").
#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    pub planner: ServiceConfig,
    pub analyst: ServiceConfig,
    pub executor: ServiceConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            planner: ServiceConfig { host: "127.0.0.1".into(), port: 50_051, breaker: BreakerSettings::default(), pool: PoolSettings::default(), timeout: TimeoutSettings::default(), retry: RetrySettings::default() },
            analyst: ServiceConfig { host: "127.0.0.1".into(), port: 50_052, breaker: BreakerSettings::default(), pool: PoolSettings::default(), timeout: TimeoutSettings::default(), retry: RetrySettings::default() },
            executor: ServiceConfig { host: "127.0.0.1".into(), port: 50_053, breaker: BreakerSettings::default(), pool: PoolSettings::default(), timeout: TimeoutSettings::default(), retry: RetrySettings::default() },
        }
    }
}

impl FabricConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies `FABRIC_<SERVICE>_PORT` overrides (the only override a
    /// deployment commonly needs at the environment layer; everything else
    /// belongs in the TOML file). Unknown or malformed values are reported,
    /// not silently ignored.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        for (var, service) in [
            ("FABRIC_PLANNER_PORT", &mut self.planner),
            ("FABRIC_ANALYST_PORT", &mut self.analyst),
            ("FABRIC_EXECUTOR_PORT", &mut self.executor),
        ] {
            if let Ok(value) = std::env::var(var) {
                service.port = value.parse().map_err(|_| ConfigError::BadEnvOverride {
                    var: var.to_string(),
                    value: value.clone(),
                    reason: "not a valid u16 port".to_string(),
                })?;
            }
        }
        Ok(self)
    }
}
