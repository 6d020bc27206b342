//! Replay of historical metric tables through the detection pipeline.
//!
//! `ReplaySource` adapts a CSV table to the `SampleSource` contract so the
//! engine can run over recorded data instead of live counters. The
//! `ReplayAnalyzer` drives the same store/detector/classifier components
//! synchronously, writing a per-row analysis; with a fixed model seed the
//! emitted anomaly flags are fully deterministic, so replaying the engine's
//! own samples log reproduces its verdicts.

use crate::classifier;
use crate::config::EngineConfig;
use crate::detector::Detector;
use crate::error::{ConfigError, EngineError, PersistError, SamplerError};
use crate::metrics::sampler::SampleSource;
use crate::metrics::MetricSample;
use crate::persist::{write_sample_row, SAMPLES_HEADER};
use crate::store::RollingStore;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Header-name to column-index mapping for the replay input schema.
///
/// Accepts both the canonical samples-log names and the short historical
/// names (`disk_read_mb`, `network_sent_mb`, ...); the short columns are
/// already per-second rates, their names notwithstanding.
#[derive(Debug, Default)]
struct ColumnMap {
    timestamp: Option<usize>,
    cpu_percent: Option<usize>,
    cpu_frequency_mhz: Option<usize>,
    memory_percent: Option<usize>,
    memory_available_gb: Option<usize>,
    disk_read: Option<usize>,
    disk_write: Option<usize>,
    network_sent: Option<usize>,
    network_recv: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Self {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|header| names.contains(&header.trim()))
        };
        ColumnMap {
            timestamp: find(&["timestamp"]),
            cpu_percent: find(&["cpu_percent"]),
            cpu_frequency_mhz: find(&["cpu_frequency_mhz"]),
            memory_percent: find(&["memory_percent"]),
            memory_available_gb: find(&["memory_available_gb"]),
            disk_read: find(&["disk_read_mb_per_s", "disk_read_mb"]),
            disk_write: find(&["disk_write_mb_per_s", "disk_write_mb"]),
            network_sent: find(&["network_sent_mb_per_s", "network_sent_mb"]),
            network_recv: find(&["network_recv_mb_per_s", "network_recv_mb"]),
        }
    }
}

/// Sample source over an ordered historical CSV table.
pub struct ReplaySource {
    records: csv::StringRecordsIntoIter<File>,
    columns: ColumnMap,
    period: ChronoDuration,
    synthetic_start: DateTime<Utc>,
    rows_read: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ReplaySource {
    pub fn open(path: &Path, period: Duration) -> Result<Self, SamplerError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let columns = ColumnMap::from_headers(reader.headers()?);
        let period = ChronoDuration::milliseconds((period.as_millis() as i64).max(1));
        Ok(ReplaySource {
            records: reader.into_records(),
            columns,
            period,
            synthetic_start: Utc::now(),
            rows_read: 0,
            last_timestamp: None,
        })
    }

    fn field(
        record: &StringRecord,
        index: Option<usize>,
        row: u64,
    ) -> Result<f64, SamplerError> {
        let raw = match index.and_then(|i| record.get(i)) {
            Some(value) => value.trim(),
            None => return Ok(0.0),
        };
        if raw.is_empty() {
            return Ok(0.0);
        }
        raw.parse::<f64>().map_err(|e| SamplerError::MalformedRow {
            row,
            reason: format!("{:?}: {}", raw, e),
        })
    }

    fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    fn row_timestamp(&self, record: &StringRecord, row: u64) -> DateTime<Utc> {
        let parsed = self
            .columns
            .timestamp
            .and_then(|i| record.get(i))
            .and_then(|raw| Self::parse_timestamp(raw.trim()));
        match parsed {
            Some(ts) => ts,
            None => self.synthetic_start + self.period * row as i32,
        }
    }
}

impl SampleSource for ReplaySource {
    fn next_sample(&mut self) -> Result<Option<MetricSample>, SamplerError> {
        let record = match self.records.next() {
            None => return Ok(None),
            Some(Err(e)) => return Err(SamplerError::ReplayInput(e)),
            Some(Ok(record)) => record,
        };
        let row = self.rows_read;
        self.rows_read += 1;

        let mut timestamp = self.row_timestamp(&record, row);
        // Out-of-order input rows are nudged forward so emitted timestamps
        // stay strictly increasing.
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                timestamp = last + ChronoDuration::milliseconds(1);
            }
        }
        self.last_timestamp = Some(timestamp);

        let columns = &self.columns;
        let sample = MetricSample {
            timestamp,
            cpu_percent: Self::field(&record, columns.cpu_percent, row)?,
            cpu_frequency_mhz: Self::field(&record, columns.cpu_frequency_mhz, row)?,
            memory_percent: Self::field(&record, columns.memory_percent, row)?,
            memory_available_gb: Self::field(&record, columns.memory_available_gb, row)?,
            disk_read_mb_per_s: Self::field(&record, columns.disk_read, row)?,
            disk_write_mb_per_s: Self::field(&record, columns.disk_write, row)?,
            network_sent_mb_per_s: Self::field(&record, columns.network_sent, row)?,
            network_recv_mb_per_s: Self::field(&record, columns.network_recv, row)?,
        };
        Ok(Some(sample.sanitize()))
    }

    fn describe(&self) -> String {
        format!("replay source ({} rows read)", self.rows_read)
    }
}

/// Outcome summary of a replay analysis.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayReport {
    /// Rows successfully analyzed.
    pub rows: u64,
    /// Rows the model flagged (`raw_score < 0`).
    pub flagged: u64,
    /// Rows that would have been reported (critical or high).
    pub reported: u64,
}

/// Synchronous file-to-file analysis over a historical table.
///
/// Uses the same store, detector, and classifier as the live engine, but on
/// the caller's thread and with blocking retrains, so the row-by-row output
/// is reproducible for a fixed seed.
pub struct ReplayAnalyzer {
    config: EngineConfig,
}

impl ReplayAnalyzer {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(ReplayAnalyzer { config })
    }

    pub fn run(&self) -> Result<ReplayReport, EngineError> {
        let input = self.config.replay_input_path.as_deref().ok_or_else(|| {
            ConfigError::ValidationFailed("replay_input_path is required for analysis".to_string())
        })?;
        let output = self.config.replay_output_path.as_deref().ok_or_else(|| {
            ConfigError::ValidationFailed("replay_output_path is required for analysis".to_string())
        })?;

        let mut source = ReplaySource::open(input, self.config.sample_period())?;
        let store = RollingStore::new(
            self.config.samples_buffer_size,
            self.config.anomalies_buffer_size,
        );
        let detector = Detector::new(&self.config);

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(PersistError::from)?;
            }
        }
        let out_file = File::create(output).map_err(PersistError::from)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(out_file);
        writer
            .write_record(SAMPLES_HEADER)
            .map_err(PersistError::from)?;

        let mut report = ReplayReport::default();
        loop {
            let sample = match source.next_sample() {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    log::warn!("skipping replay row: {}", e);
                    continue;
                }
            };

            store.append_sample(sample.clone());
            let sample_count = store.sample_count();
            if detector.wants_initial_fit(sample_count) {
                if let Err(e) = detector.fit_initial(&store, sample.timestamp) {
                    log::warn!("fit failed during replay: {}", e);
                }
            } else if detector.wants_retrain(sample.timestamp, sample_count) {
                if let Err(e) = detector.retrain_blocking(&store, sample.timestamp) {
                    log::warn!("retrain failed during replay: {}", e);
                }
            }

            match detector.score(&sample) {
                Some(score) => {
                    let (_severity, record) = classifier::classify(&sample, score);
                    if score.is_anomaly {
                        report.flagged += 1;
                    }
                    if record.is_some() {
                        report.reported += 1;
                    }
                    write_sample_row(&mut writer, &sample, score.is_anomaly, Some(score.raw_score))?;
                }
                None => write_sample_row(&mut writer, &sample, false, None)?,
            }
            report.rows += 1;
        }

        log::info!(
            "replay analysis complete: {} rows, {} flagged, {} reportable",
            report.rows,
            report.flagged,
            report.reported
        );
        Ok(report)
    }
}
