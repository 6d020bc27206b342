//! Core observation types for the telemetry engine.
//!
//! A `MetricSample` is one snapshot of system counters at a single tick.
//! An `AnomalyRecord` is produced when the classifier decides a scored
//! sample should be reported.

pub mod rates;
pub mod replay;
pub mod sampler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of features the detector consumes per sample.
pub const FEATURE_COUNT: usize = 7;

/// Feature vector fed into the anomaly model.
pub type FeatureVector = [f64; FEATURE_COUNT];

/// One snapshot of system counters at a single tick.
///
/// Rate fields are instantaneous per-second rates in MB/s (bytes divided by
/// 2^20), never raw counters. The first sample of a run carries zero rates
/// because there is no prior counter snapshot to difference against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Wall-clock instant, strictly increasing within a run.
    pub timestamp: DateTime<Utc>,
    /// CPU utilization in [0, 100].
    pub cpu_percent: f64,
    /// Current CPU frequency in MHz; 0 if unavailable.
    pub cpu_frequency_mhz: f64,
    /// Memory utilization in [0, 100].
    pub memory_percent: f64,
    /// Available memory in GB.
    pub memory_available_gb: f64,
    pub disk_read_mb_per_s: f64,
    pub disk_write_mb_per_s: f64,
    pub network_sent_mb_per_s: f64,
    pub network_recv_mb_per_s: f64,
}

impl MetricSample {
    /// Zero-valued sample at the given instant.
    pub fn zeroed(timestamp: DateTime<Utc>) -> Self {
        MetricSample {
            timestamp,
            cpu_percent: 0.0,
            cpu_frequency_mhz: 0.0,
            memory_percent: 0.0,
            memory_available_gb: 0.0,
            disk_read_mb_per_s: 0.0,
            disk_write_mb_per_s: 0.0,
            network_sent_mb_per_s: 0.0,
            network_recv_mb_per_s: 0.0,
        }
    }

    /// Ordered feature tuple consumed by the model. The order is part of the
    /// fit/score contract and must not change between the two.
    pub fn features(&self) -> FeatureVector {
        [
            self.cpu_percent,
            self.memory_percent,
            self.disk_read_mb_per_s,
            self.disk_write_mb_per_s,
            self.network_sent_mb_per_s,
            self.network_recv_mb_per_s,
            self.cpu_frequency_mhz,
        ]
    }

    /// Replace any non-finite numeric field with zero.
    pub fn sanitize(mut self) -> Self {
        for field in [
            &mut self.cpu_percent,
            &mut self.cpu_frequency_mhz,
            &mut self.memory_percent,
            &mut self.memory_available_gb,
            &mut self.disk_read_mb_per_s,
            &mut self.disk_write_mb_per_s,
            &mut self.network_sent_mb_per_s,
            &mut self.network_recv_mb_per_s,
        ] {
            if !field.is_finite() {
                *field = 0.0;
            }
        }
        self
    }
}

/// Severity bands over the raw anomaly score. Lower score is worse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Normal,
}

impl Severity {
    /// Only critical and high anomalies are reported externally.
    pub fn is_reportable(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Normal => write!(f, "normal"),
        }
    }
}

/// A reported anomaly: the originating sample plus the detector's verdict
/// and the rule-based indicators that fired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub sample: MetricSample,
    /// Decision-function output; smaller is more anomalous, 0 is the
    /// approximate boundary.
    pub raw_score: f64,
    pub severity: Severity,
    /// Ordered labels from the fixed reason vocabulary.
    pub reasons: Vec<String>,
}

/// Lifecycle states of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No model yet; accumulating the baseline window.
    Cold,
    /// A fit is running on the initial window.
    Training,
    /// A model exists; every tick is scored.
    Ready,
    /// Fatal sampler or persistence failure; no scoring performed.
    Error,
    /// Clean shutdown or exhausted replay source.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Cold => write!(f, "cold"),
            EngineState::Training => write!(f, "training"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Error => write!(f, "error"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}
