use std::env;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error_handling::RetryPolicy;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Target
    pub target_url: String,
    pub request_timeout_secs: u64,
    pub verify_tls: bool,
    pub skip_preflight: bool,

    // Load shape
    pub miners: usize,
    pub concurrency: usize,
    pub seed: Option<u64>,

    // Scenarios
    pub duplicate_ratio: f64,
    pub malformed: bool,
    pub epoch_boundary: bool,
    pub epoch_offset_ms: u64,

    // Retry
    pub max_attempts: u32,
    pub backoff_base_ms: u64,

    // Output and logging
    pub output: PathBuf,
    pub metrics_output: Option<PathBuf>,
    pub top_errors: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: "https://50.28.86.131".to_string(),
            request_timeout_secs: 30,
            verify_tls: false,
            skip_preflight: false,

            miners: 50,
            concurrency: 20,
            seed: None,

            duplicate_ratio: 0.0,
            malformed: false,
            epoch_boundary: false,
            epoch_offset_ms: 5000,

            max_attempts: 5,
            backoff_base_ms: 2000,

            output: PathBuf::from("stress_test_report.md"),
            metrics_output: None,
            top_errors: 5,
            log_level: "info".to_string(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, val: String) -> Result<T, ConfigError> {
    val.parse().map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), val))
}

fn flag(val: &str) -> bool {
    matches!(val, "1" | "true" | "yes")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` yields for the `STRESS_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(val) = lookup("STRESS_TARGET_URL") {
            config.target_url = val;
        }
        if let Some(val) = lookup("STRESS_TIMEOUT_SECS") {
            config.request_timeout_secs = parse("STRESS_TIMEOUT_SECS", val)?;
        }
        if let Some(val) = lookup("STRESS_VERIFY_TLS") {
            config.verify_tls = flag(&val);
        }
        if let Some(val) = lookup("STRESS_SKIP_PREFLIGHT") {
            config.skip_preflight = flag(&val);
        }

        if let Some(val) = lookup("STRESS_MINERS") {
            config.miners = parse("STRESS_MINERS", val)?;
        }
        if let Some(val) = lookup("STRESS_CONCURRENCY") {
            config.concurrency = parse("STRESS_CONCURRENCY", val)?;
        }
        if let Some(val) = lookup("STRESS_SEED") {
            config.seed = Some(parse("STRESS_SEED", val)?);
        }

        if let Some(val) = lookup("STRESS_DUPLICATE_RATIO") {
            config.duplicate_ratio = parse("STRESS_DUPLICATE_RATIO", val)?;
        }
        if let Some(val) = lookup("STRESS_MALFORMED") {
            config.malformed = flag(&val);
        }
        if let Some(val) = lookup("STRESS_EPOCH_BOUNDARY") {
            config.epoch_boundary = flag(&val);
        }
        if let Some(val) = lookup("STRESS_EPOCH_OFFSET_MS") {
            config.epoch_offset_ms = parse("STRESS_EPOCH_OFFSET_MS", val)?;
        }

        if let Some(val) = lookup("STRESS_MAX_ATTEMPTS") {
            config.max_attempts = parse("STRESS_MAX_ATTEMPTS", val)?;
        }
        if let Some(val) = lookup("STRESS_BACKOFF_BASE_MS") {
            config.backoff_base_ms = parse("STRESS_BACKOFF_BASE_MS", val)?;
        }

        if let Some(val) = lookup("STRESS_OUTPUT") {
            config.output = PathBuf::from(val);
        }
        if let Some(val) = lookup("STRESS_METRICS_OUTPUT") {
            config.metrics_output = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("STRESS_TOP_ERRORS") {
            config.top_errors = parse("STRESS_TOP_ERRORS", val)?;
        }
        if let Some(val) = lookup("LOG_LEVEL") {
            config.log_level = val;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_url.starts_with("http") {
            return Err(ConfigError::ValidationError("target URL must be a valid HTTP URL".to_string()));
        }
        if self.miners == 0 {
            return Err(ConfigError::ValidationError("miner count must be greater than 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError("concurrency must be greater than 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError("request timeout must be greater than 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.duplicate_ratio) {
            return Err(ConfigError::ValidationError("duplicate ratio must be within 0.0..=1.0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError("max attempts must be greater than 0".to_string()));
        }
        if self.top_errors == 0 {
            return Err(ConfigError::ValidationError("top errors must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn get_epoch_offset(&self) -> Duration {
        Duration::from_millis(self.epoch_offset_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
        }
    }
}
