//! Engine configuration: defaults, TOML loading, and startup validation.
//!
//! Every field has a default so a bare `EngineConfig::default()` produces a
//! working engine. Validation runs once at startup; invalid configuration is
//! refused before any sampling begins.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the telemetry engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expected anomaly fraction used when fitting the model. Valid range (0, 0.5].
    pub contamination: f64,

    /// Duration of the initial baseline window before the model becomes ready.
    pub training_window_seconds: u64,

    /// Minimum time between fits once the model is ready.
    pub retrain_interval_seconds: u64,

    /// Lower bound on samples needed to fit. Defaults to the training window
    /// at the configured sampling rate when not set.
    pub min_training_samples: Option<usize>,

    /// Sampling period in seconds.
    pub sample_period_seconds: f64,

    /// Capacity of the rolling sample buffer.
    pub samples_buffer_size: usize,

    /// Capacity of the rolling anomaly buffer.
    pub anomalies_buffer_size: usize,

    /// Append-only tabular log of every sample.
    pub samples_log_path: PathBuf,

    /// Append-only structured log of reported anomalies.
    pub anomalies_log_path: PathBuf,

    /// Optional historical table to replay instead of sampling live.
    pub replay_input_path: Option<PathBuf>,

    /// Optional path for a per-row replay analysis.
    pub replay_output_path: Option<PathBuf>,

    /// Retraining window is `min_training_samples * retrain_window_multiplier`,
    /// capped by the sample buffer capacity.
    pub retrain_window_multiplier: usize,

    /// Seed for the isolation forest, so fit and score are reproducible.
    pub model_seed: u64,

    /// Trees in the isolation forest.
    pub forest_trees: usize,

    /// Graceful shutdown deadline in seconds.
    pub shutdown_deadline_seconds: u64,

    /// Consecutive persistence failures tolerated before the engine enters
    /// the error state.
    pub max_consecutive_persist_failures: u32,

    /// Consecutive failed counter refreshes tolerated before the sampler is
    /// considered dead.
    pub max_consecutive_sampler_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            contamination: 0.05,
            training_window_seconds: 60,
            retrain_interval_seconds: 300,
            min_training_samples: None,
            sample_period_seconds: 1.0,
            samples_buffer_size: 1000,
            anomalies_buffer_size: 100,
            samples_log_path: PathBuf::from("./logs/metrics_history.csv"),
            anomalies_log_path: PathBuf::from("./logs/anomalies.jsonl"),
            replay_input_path: None,
            replay_output_path: None,
            retrain_window_multiplier: 4,
            model_seed: 42,
            forest_trees: 100,
            shutdown_deadline_seconds: 5,
            max_consecutive_persist_failures: 10,
            max_consecutive_sampler_failures: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional path, falling back to validated defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let config = EngineConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Validate all parameters. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ConfigError::ValidationFailed(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.sample_period_seconds <= 0.0 || !self.sample_period_seconds.is_finite() {
            return Err(ConfigError::ValidationFailed(format!(
                "sample_period_seconds must be positive, got {}",
                self.sample_period_seconds
            )));
        }
        if self.training_window_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "training_window_seconds must be positive".to_string(),
            ));
        }
        if self.retrain_interval_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "retrain_interval_seconds must be positive".to_string(),
            ));
        }
        if self.samples_buffer_size == 0 || self.anomalies_buffer_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "buffer sizes must be positive".to_string(),
            ));
        }
        if self.min_training_samples == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "min_training_samples must be positive when set".to_string(),
            ));
        }
        if self.retrain_window_multiplier == 0 {
            return Err(ConfigError::ValidationFailed(
                "retrain_window_multiplier must be positive".to_string(),
            ));
        }
        if self.forest_trees == 0 {
            return Err(ConfigError::ValidationFailed(
                "forest_trees must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective lower bound on samples needed before the first fit.
    ///
    /// Derived from the training window at the configured sampling rate
    /// unless pinned explicitly.
    pub fn effective_min_training_samples(&self) -> usize {
        match self.min_training_samples {
            Some(n) => n,
            None => {
                let derived =
                    (self.training_window_seconds as f64 / self.sample_period_seconds).round();
                (derived as usize).max(2)
            }
        }
    }

    /// Sampling period as a `Duration`.
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.sample_period_seconds)
    }

    /// Graceful shutdown deadline as a `Duration`.
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.contamination, 0.05);
        assert_eq!(config.samples_buffer_size, 1000);
        assert_eq!(config.anomalies_buffer_size, 100);
    }

    #[test]
    fn test_contamination_boundaries() {
        let mut config = EngineConfig::default();

        config.contamination = 0.5;
        assert!(config.validate().is_ok());

        config.contamination = 0.0;
        assert!(config.validate().is_err());

        config.contamination = 0.6;
        assert!(config.validate().is_err());

        config.contamination = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_training_samples_derivation() {
        let mut config = EngineConfig::default();
        config.training_window_seconds = 60;
        config.sample_period_seconds = 1.0;
        assert_eq!(config.effective_min_training_samples(), 60);

        config.sample_period_seconds = 0.5;
        assert_eq!(config.effective_min_training_samples(), 120);

        config.min_training_samples = Some(30);
        assert_eq!(config.effective_min_training_samples(), 30);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syswatch.toml");
        std::fs::write(
            &path,
            r#"
contamination = 0.1
training_window_seconds = 30
samples_buffer_size = 500
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.contamination, 0.1);
        assert_eq!(config.training_window_seconds, 30);
        assert_eq!(config.samples_buffer_size, 500);
        // Unspecified fields keep their defaults.
        assert_eq!(config.anomalies_buffer_size, 100);
    }

    #[test]
    fn test_load_rejects_invalid_contamination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syswatch.toml");
        std::fs::write(&path, "contamination = 0.9\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load(Path::new("/nonexistent/syswatch.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
