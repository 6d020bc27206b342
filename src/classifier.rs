//! Severity classification and reason assembly for scored samples.
//!
//! The severity bands are fixed partitions of the raw-score axis; the
//! thresholds are constants of the engine, independent of the configured
//! contamination. Only critical and high severities produce a reported
//! `AnomalyRecord`; medium and normal verdicts are counted in statistics
//! and dropped.

use crate::detector::Score;
use crate::metrics::{AnomalyRecord, MetricSample, Severity};

/// Scores below this are critical.
pub const CRITICAL_THRESHOLD: f64 = -0.7;
/// Scores in [CRITICAL_THRESHOLD, HIGH_THRESHOLD) are high.
pub const HIGH_THRESHOLD: f64 = -0.5;
/// Scores in [HIGH_THRESHOLD, MEDIUM_THRESHOLD) are medium.
pub const MEDIUM_THRESHOLD: f64 = -0.3;

/// Rule thresholds for the reason vocabulary.
const CPU_HIGH_PERCENT: f64 = 80.0;
const MEMORY_HIGH_PERCENT: f64 = 80.0;
const DISK_BURST_MB_PER_S: f64 = 50.0;
const NETWORK_BURST_MB_PER_S: f64 = 50.0;

pub const REASON_HIGH_CPU: &str = "high CPU";
pub const REASON_HIGH_MEMORY: &str = "high memory";
pub const REASON_DISK_BURST: &str = "disk burst";
pub const REASON_NETWORK_BURST: &str = "network burst";
/// Marker used when the model flagged the sample but no rule fired.
pub const REASON_MODEL_ONLY: &str = "model-only";

/// Map a raw score onto its severity band.
pub fn severity_for(raw_score: f64) -> Severity {
    if raw_score < CRITICAL_THRESHOLD {
        Severity::Critical
    } else if raw_score < HIGH_THRESHOLD {
        Severity::High
    } else if raw_score < MEDIUM_THRESHOLD {
        Severity::Medium
    } else {
        Severity::Normal
    }
}

/// Evaluate the rule predicates against a sample, in fixed order.
pub fn reasons_for(sample: &MetricSample) -> Vec<String> {
    let mut reasons = Vec::new();
    if sample.cpu_percent > CPU_HIGH_PERCENT {
        reasons.push(REASON_HIGH_CPU.to_string());
    }
    if sample.memory_percent > MEMORY_HIGH_PERCENT {
        reasons.push(REASON_HIGH_MEMORY.to_string());
    }
    if sample.disk_read_mb_per_s + sample.disk_write_mb_per_s > DISK_BURST_MB_PER_S {
        reasons.push(REASON_DISK_BURST.to_string());
    }
    if sample.network_sent_mb_per_s + sample.network_recv_mb_per_s > NETWORK_BURST_MB_PER_S {
        reasons.push(REASON_NETWORK_BURST.to_string());
    }
    if reasons.is_empty() {
        reasons.push(REASON_MODEL_ONLY.to_string());
    }
    reasons
}

/// Classify one scored sample.
///
/// Returns the severity band (always) and a record to report (only for
/// critical and high).
pub fn classify(sample: &MetricSample, score: Score) -> (Severity, Option<AnomalyRecord>) {
    let severity = severity_for(score.raw_score);
    if !severity.is_reportable() {
        return (severity, None);
    }
    let record = AnomalyRecord {
        sample: sample.clone(),
        raw_score: score.raw_score,
        severity,
        reasons: reasons_for(sample),
    };
    (severity, Some(record))
}
