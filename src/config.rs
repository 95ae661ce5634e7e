//! Engine Configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `RISKFLOW_*` environment variables. The CLI applies its flags last.
//!
//! ```yaml
//! max_parallel: 8
//! retry:
//!   base_delay_ms: 500
//! risk:
//!   thresholds: { auto_approve: 0.25, warn: 0.5, review: 0.7, hitl: 0.9 }
//! record_dir: ./records
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::risk::assessment::DimensionWeights;
use crate::risk::routing::RoutingThresholds;

pub const ENV_MAX_PARALLEL: &str = "RISKFLOW_MAX_PARALLEL";
pub const ENV_SEQUENTIAL: &str = "RISKFLOW_SEQUENTIAL";
pub const ENV_RECORD_DIR: &str = "RISKFLOW_RECORD_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{var}={value} is not valid: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry backoff settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter upper bound as a fraction of the delay, in [0, 1)
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Event stream settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EventConfig {
    /// Events kept per execution for replay
    pub history_limit: usize,
    /// Streams untouched this long are reclaimed
    pub idle_timeout_secs: u64,
    /// Per-subscriber queue length before the subscriber is dropped
    pub subscriber_buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            idle_timeout_secs: 3600,
            subscriber_buffer: 256,
        }
    }
}

impl EventConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Risk scoring and routing settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: DimensionWeights,
    pub thresholds: RoutingThresholds,
    /// Past runs required before anomaly scores count
    pub anomaly_min_samples: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: DimensionWeights::default(),
            thresholds: RoutingThresholds::default(),
            anomaly_min_samples: 10,
        }
    }
}

/// Complete engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum steps running at once within a level
    pub max_parallel: usize,
    /// Run each level one step at a time
    pub sequential: bool,
    pub retry: RetryConfig,
    pub events: EventConfig,
    pub risk: RiskConfig,
    /// Where execution records are written, if anywhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get().max(1),
            sequential: false,
            retry: RetryConfig::default(),
            events: EventConfig::default(),
            risk: RiskConfig::default(),
            record_dir: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl EngineConfig {
    /// Reads a YAML config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults or file, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RISKFLOW_*` overrides read through `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_MAX_PARALLEL) {
            self.max_parallel = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_MAX_PARALLEL,
                value: value.clone(),
                reason: "expected a positive integer".to_string(),
            })?;
            debug!("{} overrides max_parallel: {}", ENV_MAX_PARALLEL, self.max_parallel);
        }

        if let Some(value) = lookup(ENV_SEQUENTIAL) {
            self.sequential = parse_bool(&value).ok_or_else(|| ConfigError::Env {
                var: ENV_SEQUENTIAL,
                value: value.clone(),
                reason: "expected true or false".to_string(),
            })?;
        }

        if let Some(value) = lookup(ENV_RECORD_DIR) {
            if !value.trim().is_empty() {
                self.record_dir = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".to_string()));
        }

        let weight_sum = self.risk.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "risk weights must sum to 1.0, got {:.6}",
                weight_sum
            )));
        }

        if !self.risk.thresholds.is_ordered() {
            return Err(ConfigError::Invalid(
                "routing thresholds must increase: auto_approve < warn < review < hitl".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "jitter_ratio {} must be within [0, 1)",
                self.retry.jitter_ratio
            )));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }

        if self.events.history_limit == 0 || self.events.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event history_limit and subscriber_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.max_parallel >= 1);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.events.history_limit, 1000);
        assert_eq!(config.risk.anomaly_min_samples, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("riskflow.yaml");
        std::fs::write(&path, "max_parallel: 3\nretry:\n  base_delay_ms: 200\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.risk.thresholds.hitl, 0.9);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_PARALLEL, "2"),
            (ENV_SEQUENTIAL, "yes"),
            (ENV_RECORD_DIR, "/tmp/records"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_env_from(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_parallel, 2);
        assert!(config.sequential);
        assert_eq!(config.record_dir, Some(PathBuf::from("/tmp/records")));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = EngineConfig::default();
        let result = config.apply_env_from(|var| (var == ENV_MAX_PARALLEL).then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = EngineConfig::default();
        config.risk.weights.safety = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_parallel_and_jitter() {
        let mut config = EngineConfig::default();
        config.max_parallel = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.jitter_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = EngineConfig::default();
        config.risk.thresholds.review = 0.95;
        assert!(config.validate().is_err());
    }
}
