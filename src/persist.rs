//! Append-only persistence and the ordered fan-out pipeline.
//!
//! The sampling loop hands each tick's output to a dedicated writer thread
//! through a bounded channel, so the hot path never blocks on disk. The
//! writer persists the sample row, then broadcasts the sample event, then
//! (for reported anomalies) persists the structured record and broadcasts
//! the anomaly event. FIFO delivery preserves per-sample ordering, and a
//! client that reads the file before subscribing can never miss an event
//! that is absent from both.

use crate::bus::{BusEvent, EventBus};
use crate::error::PersistError;
use crate::metrics::{AnomalyRecord, MetricSample};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the tick pipeline between the sampling loop and the writer.
const PIPELINE_CAPACITY: usize = 1024;

/// Column order of the samples log. Stable across releases; readers key on
/// this header.
pub const SAMPLES_HEADER: [&str; 11] = [
    "timestamp",
    "cpu_percent",
    "cpu_frequency_mhz",
    "memory_percent",
    "memory_available_gb",
    "disk_read_mb_per_s",
    "disk_write_mb_per_s",
    "network_sent_mb_per_s",
    "network_recv_mb_per_s",
    "is_anomaly",
    "raw_score",
];

/// Everything one tick produces for persistence and broadcast.
#[derive(Clone, Debug)]
pub struct TickOutput {
    pub sample: MetricSample,
    pub is_anomaly: bool,
    pub raw_score: Option<f64>,
    /// Present only when the classifier decided to report.
    pub record: Option<AnomalyRecord>,
}

enum WriterCommand {
    Tick(TickOutput),
    Shutdown,
}

/// One line of the anomalies log.
#[derive(Serialize)]
struct AnomalyLogLine<'a> {
    timestamp: &'a DateTime<Utc>,
    raw_score: f64,
    severity: crate::metrics::Severity,
    reasons: &'a [String],
    sample: &'a MetricSample,
}

/// Cloneable sending side of the tick pipeline, held by the sampling loop.
#[derive(Clone)]
pub struct PipelineSender {
    tx: Sender<WriterCommand>,
    dropped_ticks: Arc<AtomicU64>,
}

impl PipelineSender {
    /// Queue one tick for persistence and broadcast. Never blocks: if the
    /// pipeline is full the tick's fan-out is dropped and counted.
    pub fn dispatch(&self, tick: TickOutput) {
        match self.tx.try_send(WriterCommand::Tick(tick)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("persistence pipeline full, dropped tick (total {})", dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("persistence writer is gone, dropped tick");
            }
        }
    }

    /// Ticks that never reached the writer because the pipeline was full.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }
}

/// Owning handle for the writer thread, held by the engine for shutdown.
pub struct PersistenceHandle {
    sender: PipelineSender,
    join: Option<std::thread::JoinHandle<()>>,
}

impl PersistenceHandle {
    /// Open both logs and start the writer thread.
    pub fn spawn(
        samples_path: &Path,
        anomalies_path: &Path,
        bus: Arc<EventBus>,
        fatal: Arc<AtomicBool>,
        max_consecutive_failures: u32,
    ) -> Result<Self, PersistError> {
        let writer = LogWriter::open(
            samples_path,
            anomalies_path,
            bus,
            fatal,
            max_consecutive_failures,
        )?;

        let (tx, rx) = bounded(PIPELINE_CAPACITY);
        let join = std::thread::Builder::new()
            .name("syswatch-writer".to_string())
            .spawn(move || writer.run(rx))
            .map_err(|e| {
                PersistError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;

        Ok(PersistenceHandle {
            sender: PipelineSender {
                tx,
                dropped_ticks: Arc::new(AtomicU64::new(0)),
            },
            join: Some(join),
        })
    }

    /// Sending side for the sampling loop.
    pub fn sender(&self) -> PipelineSender {
        self.sender.clone()
    }

    /// Queue one tick for persistence and broadcast.
    pub fn dispatch(&self, tick: TickOutput) {
        self.sender.dispatch(tick);
    }

    /// Ticks that never reached the writer because the pipeline was full.
    pub fn dropped_ticks(&self) -> u64 {
        self.sender.dropped_ticks()
    }

    /// Flush outstanding work and stop the writer, bounded by `deadline`.
    pub fn shutdown(mut self, deadline: Duration) {
        let _ = self.sender.tx.send_timeout(WriterCommand::Shutdown, deadline);
        let deadline_at = Instant::now() + deadline;
        if let Some(join) = self.join.take() {
            while !join.is_finished() && Instant::now() < deadline_at {
                std::thread::sleep(Duration::from_millis(10));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                log::warn!("persistence writer did not stop within {:?}, abandoning", deadline);
            }
        }
    }
}

struct LogWriter {
    samples: csv::Writer<File>,
    anomalies: BufWriter<File>,
    bus: Arc<EventBus>,
    fatal: Arc<AtomicBool>,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl LogWriter {
    fn open(
        samples_path: &Path,
        anomalies_path: &Path,
        bus: Arc<EventBus>,
        fatal: Arc<AtomicBool>,
        max_consecutive_failures: u32,
    ) -> Result<Self, PersistError> {
        for path in [samples_path, anomalies_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let samples_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(samples_path)?;
        let needs_header = samples_file.metadata()?.len() == 0;
        let mut samples = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(samples_file);
        if needs_header {
            samples.write_record(SAMPLES_HEADER)?;
            samples.flush()?;
        }

        let anomalies_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(anomalies_path)?;
        let anomalies = BufWriter::new(anomalies_file);

        Ok(LogWriter {
            samples,
            anomalies,
            bus,
            fatal,
            consecutive_failures: 0,
            max_consecutive_failures,
        })
    }

    fn run(mut self, rx: Receiver<WriterCommand>) {
        log::debug!("persistence writer started");
        loop {
            match rx.recv() {
                Ok(WriterCommand::Tick(tick)) => self.process_tick(tick),
                Ok(WriterCommand::Shutdown) | Err(_) => break,
            }
        }
        let _ = self.samples.flush();
        let _ = self.anomalies.flush();
        log::debug!("persistence writer stopped");
    }

    fn process_tick(&mut self, tick: TickOutput) {
        // The row must hit the file before the matching broadcast.
        let written = write_sample_row(
            &mut self.samples,
            &tick.sample,
            tick.is_anomaly,
            tick.raw_score,
        );
        self.record_outcome(written);
        self.bus.publish(&BusEvent::SampleUpdate {
            sample: tick.sample,
            is_anomaly: tick.is_anomaly,
            raw_score: tick.raw_score,
        });

        if let Some(record) = tick.record {
            let written = Self::write_anomaly_line(&mut self.anomalies, &record);
            self.record_outcome(written);
            self.bus.publish(&BusEvent::AnomalyReport { record });
        }
    }

    fn write_anomaly_line(
        writer: &mut BufWriter<File>,
        record: &AnomalyRecord,
    ) -> Result<(), PersistError> {
        let line = serde_json::to_string(&AnomalyLogLine {
            timestamp: &record.sample.timestamp,
            raw_score: record.raw_score,
            severity: record.severity,
            reasons: &record.reasons,
            sample: &record.sample,
        })?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    fn record_outcome(&mut self, result: Result<(), PersistError>) {
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                log::error!(
                    "log write failed ({} consecutive): {}",
                    self.consecutive_failures,
                    e
                );
                if self.consecutive_failures == self.max_consecutive_failures {
                    log::error!(
                        "{} consecutive persistence failures, signalling engine error",
                        self.consecutive_failures
                    );
                    self.fatal.store(true, Ordering::Release);
                }
            }
        }
    }
}

/// Append one sample row in the stable column order. Shared by the live
/// writer and the replay analyzer so both outputs stay format-identical.
pub(crate) fn write_sample_row(
    writer: &mut csv::Writer<File>,
    sample: &MetricSample,
    is_anomaly: bool,
    raw_score: Option<f64>,
) -> Result<(), PersistError> {
    let score_field = match raw_score {
        Some(score) => score.to_string(),
        None => String::new(),
    };
    writer.write_record([
        sample
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        sample.cpu_percent.to_string(),
        sample.cpu_frequency_mhz.to_string(),
        sample.memory_percent.to_string(),
        sample.memory_available_gb.to_string(),
        sample.disk_read_mb_per_s.to_string(),
        sample.disk_write_mb_per_s.to_string(),
        sample.network_sent_mb_per_s.to_string(),
        sample.network_recv_mb_per_s.to_string(),
        if is_anomaly { "True" } else { "False" }.to_string(),
        score_field,
    ])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Severity;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn sample_at(i: i64) -> MetricSample {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut s = MetricSample::zeroed(base + ChronoDuration::seconds(i));
        s.cpu_percent = 10.0 + i as f64;
        s
    }

    fn spawn_handle(dir: &tempfile::TempDir) -> (PersistenceHandle, Arc<EventBus>, Arc<AtomicBool>) {
        let bus = Arc::new(EventBus::new());
        let fatal = Arc::new(AtomicBool::new(false));
        let handle = PersistenceHandle::spawn(
            &dir.path().join("metrics_history.csv"),
            &dir.path().join("anomalies.jsonl"),
            Arc::clone(&bus),
            Arc::clone(&fatal),
            10,
        )
        .unwrap();
        (handle, bus, fatal)
    }

    #[test]
    fn test_samples_log_header_and_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _bus, _fatal) = spawn_handle(&dir);

        for i in 0..5 {
            handle.dispatch(TickOutput {
                sample: sample_at(i),
                is_anomaly: false,
                raw_score: if i >= 3 { Some(0.2) } else { None },
                record: None,
            });
        }
        handle.shutdown(Duration::from_secs(5));

        let content = std::fs::read_to_string(dir.path().join("metrics_history.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], SAMPLES_HEADER.join(","));

        // Rows appear in sample order; cold rows carry an empty score field.
        let mut prev_ts = String::new();
        for (i, line) in lines[1..].iter().enumerate() {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 11);
            assert!(fields[0].to_string() > prev_ts);
            prev_ts = fields[0].to_string();
            assert_eq!(fields[9], "False");
            if i < 3 {
                assert_eq!(fields[10], "");
            } else {
                assert_eq!(fields[10], "0.2");
            }
        }
    }

    #[test]
    fn test_anomaly_log_line_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _bus, _fatal) = spawn_handle(&dir);

        let sample = sample_at(0);
        let record = AnomalyRecord {
            sample: sample.clone(),
            raw_score: -0.82,
            severity: Severity::Critical,
            reasons: vec!["high CPU".to_string()],
        };
        handle.dispatch(TickOutput {
            sample,
            is_anomaly: true,
            raw_score: Some(-0.82),
            record: Some(record),
        });
        handle.shutdown(Duration::from_secs(5));

        let content = std::fs::read_to_string(dir.path().join("anomalies.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["severity"], "critical");
        assert_eq!(parsed["raw_score"], -0.82);
        assert_eq!(parsed["reasons"][0], "high CPU");
        assert!(parsed["sample"]["cpu_percent"].is_number());
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn test_write_precedes_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, bus, _fatal) = spawn_handle(&dir);
        let sub = bus.subscribe(8);

        handle.dispatch(TickOutput {
            sample: sample_at(0),
            is_anomaly: false,
            raw_score: None,
            record: None,
        });

        // Once the broadcast arrives, the row is already on disk.
        let event = sub.recv_timeout(Duration::from_secs(5));
        assert!(matches!(event, Some(BusEvent::SampleUpdate { .. })));
        let content = std::fs::read_to_string(dir.path().join("metrics_history.csv")).unwrap();
        assert_eq!(content.lines().count(), 2);

        handle.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn test_header_not_duplicated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (handle, _bus, _fatal) = spawn_handle(&dir);
            handle.dispatch(TickOutput {
                sample: sample_at(0),
                is_anomaly: false,
                raw_score: None,
                record: None,
            });
            handle.shutdown(Duration::from_secs(5));
        }
        {
            let (handle, _bus, _fatal) = spawn_handle(&dir);
            handle.dispatch(TickOutput {
                sample: sample_at(1),
                is_anomaly: false,
                raw_score: None,
                record: None,
            });
            handle.shutdown(Duration::from_secs(5));
        }

        let content = std::fs::read_to_string(dir.path().join("metrics_history.csv")).unwrap();
        let headers = content
            .lines()
            .filter(|line| line.starts_with("timestamp,"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(content.lines().count(), 3);
    }
}
