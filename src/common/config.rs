//! Configuration for farmd components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Executor/worker pool config
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Failure detector config
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Failover controller config
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            detector: DetectorConfig::default(),
            failover: FailoverConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl FarmConfig {
    /// Load configuration from an optional TOML file plus `FARMD_*` env vars.
    ///
    /// Missing file means defaults; env vars override file values
    /// (e.g. `FARMD_DETECTOR__THRESHOLD=5`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("FARMD").separator("__"));

        let cfg = builder
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        cfg.try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    /// Reject nonsensical values before wiring anything up.
    pub fn validate(&self) -> crate::Result<()> {
        if self.executor.workers == 0 {
            return Err(crate::Error::InvalidConfig(
                "executor.workers must be at least 1".into(),
            ));
        }
        if self.detector.threshold == 0 {
            return Err(crate::Error::InvalidConfig(
                "detector.threshold must be at least 1".into(),
            ));
        }
        if self.detector.window_ms < self.detector.interval_ms {
            return Err(crate::Error::InvalidConfig(
                "detector.window_ms must cover at least one polling interval".into(),
            ));
        }
        Ok(())
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound on lock waits in milliseconds (0 = wait forever)
    #[serde(default)]
    pub lock_wait_ms: u64,

    /// Transport-error retries per step
    #[serde(default = "default_driver_retries")]
    pub driver_retries: usize,

    /// Initial retry backoff
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Retention horizon for terminal job checkpoints
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_workers() -> usize {
    4
}
fn default_driver_retries() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    100
}
fn default_retention() -> u64 {
    86_400
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lock_wait_ms: 0,
            driver_retries: default_driver_retries(),
            retry_delay_ms: default_retry_delay(),
            retention_secs: default_retention(),
        }
    }
}

impl ExecutorConfig {
    /// Lock wait bound, `None` meaning unbounded
    pub fn lock_wait(&self) -> Option<Duration> {
        if self.lock_wait_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.lock_wait_ms))
        }
    }
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Polling interval
    #[serde(default = "default_detect_interval")]
    pub interval_ms: u64,

    /// Consecutive failures before a server is declared faulty
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Window within which the failures must accumulate
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Per-ping timeout
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
}

fn default_detect_interval() -> u64 {
    2_000
}
fn default_threshold() -> u32 {
    3
}
fn default_window() -> u64 {
    30_000
}
fn default_ping_timeout() -> u64 {
    1_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_detect_interval(),
            threshold: default_threshold(),
            window_ms: default_window(),
            ping_timeout_ms: default_ping_timeout(),
        }
    }
}

/// Failover controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Cool-down between failovers of the same group
    #[serde(default = "default_failover_interval")]
    pub interval_ms: u64,
}

fn default_failover_interval() -> u64 {
    60_000
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_failover_interval(),
        }
    }
}
