//! Unified error type hierarchy for the telemetry engine
//!
//! Provides structured error handling with ConfigError, SamplerError,
//! DetectorError, PersistError, and EngineError.

use std::io;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Raised at startup before any sampling begins; the CLI shell maps these
/// to exit code 2.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Sampling-source errors.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// One row of a replay table could not be parsed; the row is skipped.
    #[error("Malformed replay row {row}: {reason}")]
    MalformedRow { row: u64, reason: String },

    #[error("Replay input error: {0}")]
    ReplayInput(#[from] csv::Error),

    #[error("IO error while sampling: {0}")]
    IoError(#[from] io::Error),

    /// The OS refused to supply any counter for too many consecutive ticks.
    /// This transitions the whole engine to the error state.
    #[error("Fatal sampler failure: {0}")]
    Fatal(String),
}

impl SamplerError {
    /// True if this error must take the engine down rather than be absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SamplerError::Fatal(_))
    }
}

/// Detector fit and scoring errors.
///
/// Fit failures are absorbed locally: the detector keeps its previous model
/// (or stays cold) and the failure is logged at warning level.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Degenerate training data: {rows} rows, {varying_features} varying features")]
    DegenerateTrainingData { rows: usize, varying_features: usize },

    #[error("Model is not trained yet")]
    NotReady,
}

/// Persistence (append-only log) errors.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error while writing log: {0}")]
    IoError(#[from] io::Error),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persistence pipeline is closed")]
    PipelineClosed,
}

/// Top-level error type for engine lifecycle operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Failed to spawn engine task '{task}': {reason}")]
    Spawn { task: String, reason: String },
}

/// Result alias used by fallible engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
