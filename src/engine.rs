//! The telemetry engine: lifecycle, the sampling loop, and the query surface.
//!
//! `TelemetryEngine::start` spawns two long-lived threads: the sampling loop
//! (sample, derive, store, score, classify, dispatch) and the persistence
//! writer. The engine value owns all state; there are no process globals,
//! and shutting the engine down terminates everything it started.
//!
//! The sampling loop never blocks on disk or on subscribers: persistence
//! goes through a bounded pipeline, and the bus drops from the head of slow
//! consumers' queues.

use crate::bus::{BusEvent, EventBus, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::classifier;
use crate::config::EngineConfig;
use crate::detector::{Detector, ModelSlot};
use crate::error::{EngineError, Result};
use crate::metrics::sampler::{LiveSampler, SampleSource};
use crate::metrics::{AnomalyRecord, EngineState, MetricSample, Severity};
use crate::persist::{PersistenceHandle, PipelineSender, TickOutput};
use crate::store::RollingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Aggregate statistics served with every snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub sample_count: u64,
    pub anomaly_count: u64,
    pub uptime_seconds: u64,
    pub state: EngineState,
    /// Timestamp of the fit that produced the current model.
    pub trained_at: Option<DateTime<Utc>>,
    /// Training-window size of the current model.
    pub model_sample_count: Option<usize>,
    pub severity_totals: SeverityTotals,
    /// Ticks whose persistence/broadcast was dropped under backpressure.
    pub dropped_ticks: u64,
}

/// Per-band verdict totals across all scored samples.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SeverityTotals {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub normal: u64,
}

/// Point-in-time view served to a newly connected client.
#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub samples: Vec<MetricSample>,
    pub anomalies: Vec<AnomalyRecord>,
    pub stats: EngineStats,
}

struct SeverityCounters {
    critical: AtomicU64,
    high: AtomicU64,
    medium: AtomicU64,
    normal: AtomicU64,
}

impl SeverityCounters {
    fn new() -> Self {
        SeverityCounters {
            critical: AtomicU64::new(0),
            high: AtomicU64::new(0),
            medium: AtomicU64::new(0),
            normal: AtomicU64::new(0),
        }
    }

    fn increment(&self, severity: Severity) {
        let counter = match severity {
            Severity::Critical => &self.critical,
            Severity::High => &self.high,
            Severity::Medium => &self.medium,
            Severity::Normal => &self.normal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn totals(&self) -> SeverityTotals {
        SeverityTotals {
            critical: self.critical.load(Ordering::Relaxed),
            high: self.high.load(Ordering::Relaxed),
            medium: self.medium.load(Ordering::Relaxed),
            normal: self.normal.load(Ordering::Relaxed),
        }
    }
}

/// Current engine state; transitions are broadcast as `state_update` events.
struct SharedState {
    current: RwLock<EngineState>,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            current: RwLock::new(EngineState::Cold),
        }
    }

    fn get(&self) -> EngineState {
        *self.current.read().unwrap()
    }

    fn set(&self, next: EngineState, bus: &EventBus) {
        {
            let mut current = self.current.write().unwrap();
            if *current == next {
                return;
            }
            log::info!("engine state {} -> {}", *current, next);
            *current = next;
        }
        bus.publish(&BusEvent::StateUpdate { state: next });
    }
}

/// The running engine. Owns its threads, buffers, and model.
pub struct TelemetryEngine {
    config: EngineConfig,
    store: Arc<RollingStore>,
    bus: Arc<EventBus>,
    state: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    model_slot: ModelSlot,
    severity: Arc<SeverityCounters>,
    pipeline: PipelineSender,
    persist: Option<PersistenceHandle>,
    sampler_thread: Option<std::thread::JoinHandle<()>>,
    started_at: Instant,
}

impl TelemetryEngine {
    /// Start the engine over live OS counters.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let source = LiveSampler::new(
            config.sample_period(),
            config.max_consecutive_sampler_failures,
        );
        Self::start_with_source(config, Box::new(source))
    }

    /// Start the engine over an arbitrary sample source (replay, tests,
    /// generated data).
    pub fn start_with_source(
        config: EngineConfig,
        source: Box<dyn SampleSource>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(RollingStore::new(
            config.samples_buffer_size,
            config.anomalies_buffer_size,
        ));
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(SharedState::new());
        let stop = Arc::new(AtomicBool::new(false));
        let fatal_persist = Arc::new(AtomicBool::new(false));
        let severity = Arc::new(SeverityCounters::new());

        let persist = PersistenceHandle::spawn(
            &config.samples_log_path,
            &config.anomalies_log_path,
            Arc::clone(&bus),
            Arc::clone(&fatal_persist),
            config.max_consecutive_persist_failures,
        )?;
        let pipeline = persist.sender();

        let detector = Detector::new(&config);
        let model_slot = detector.model_slot();

        log::info!(
            "starting telemetry engine: {}, training window {} samples",
            source.describe(),
            detector.min_training_samples()
        );

        let sampler_loop = SamplerLoop {
            source,
            detector,
            store: Arc::clone(&store),
            bus: Arc::clone(&bus),
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            fatal_persist,
            severity: Arc::clone(&severity),
            pipeline: pipeline.clone(),
        };
        let sampler_thread = std::thread::Builder::new()
            .name("syswatch-sampler".to_string())
            .spawn(move || sampler_loop.run())
            .map_err(|e| EngineError::Spawn {
                task: "sampling loop".to_string(),
                reason: e.to_string(),
            })?;

        Ok(TelemetryEngine {
            config,
            store,
            bus,
            state,
            stop,
            model_slot,
            severity,
            pipeline,
            persist: Some(persist),
            sampler_thread: Some(sampler_thread),
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a live subscriber with a bounded queue.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.bus.subscribe(capacity)
    }

    pub fn subscribe_default(&self) -> Subscription {
        self.subscribe(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn stats(&self) -> EngineStats {
        let model = self.model_slot.read().unwrap().clone();
        EngineStats {
            sample_count: self.store.sample_count(),
            anomaly_count: self.store.anomaly_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            state: self.state.get(),
            trained_at: model.as_ref().map(|m| m.trained_at()),
            model_sample_count: model.as_ref().map(|m| m.sample_count_at_fit()),
            severity_totals: self.severity.totals(),
            dropped_ticks: self.pipeline.dropped_ticks(),
        }
    }

    /// Last `k` samples and last `l` anomalies plus current statistics,
    /// capped by the configured buffer sizes.
    pub fn snapshot(&self, k: usize, l: usize) -> EngineSnapshot {
        EngineSnapshot {
            samples: self
                .store
                .recent_samples(k.min(self.config.samples_buffer_size)),
            anomalies: self
                .store
                .recent_anomalies(l.min(self.config.anomalies_buffer_size)),
            stats: self.stats(),
        }
    }

    /// Block until the engine reaches a terminal state or `timeout` passes.
    pub fn wait_for_terminal(&self, timeout: Duration) -> EngineState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state.get();
            if matches!(state, EngineState::Stopped | EngineState::Error) {
                return state;
            }
            if Instant::now() >= deadline {
                return state;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Graceful shutdown bounded by the configured deadline: the sampling
    /// loop stops at the next tick boundary and persistence flushes its
    /// buffers. Work outstanding past the deadline is abandoned.
    pub fn shutdown(mut self) -> EngineState {
        let deadline = self.config.shutdown_deadline();
        let deadline_at = Instant::now() + deadline;
        self.stop.store(true, Ordering::Release);

        if let Some(join) = self.sampler_thread.take() {
            while !join.is_finished() && Instant::now() < deadline_at {
                std::thread::sleep(Duration::from_millis(10));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                log::warn!("sampling loop did not stop within {:?}, abandoning", deadline);
            }
        }

        if let Some(persist) = self.persist.take() {
            let remaining = deadline_at
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(100));
            persist.shutdown(remaining);
        }

        let final_state = if self.state.get() == EngineState::Error {
            EngineState::Error
        } else {
            self.state.set(EngineState::Stopped, &self.bus);
            EngineState::Stopped
        };
        log::info!("engine shut down in state {}", final_state);
        final_state
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        // Engines dropped without an explicit shutdown still stop sampling.
        self.stop.store(true, Ordering::Release);
    }
}

/// The hot path: one long-lived thread driving sample -> store -> score ->
/// classify -> dispatch, never blocking on consumers.
struct SamplerLoop {
    source: Box<dyn SampleSource>,
    detector: Detector,
    store: Arc<RollingStore>,
    bus: Arc<EventBus>,
    state: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    fatal_persist: Arc<AtomicBool>,
    severity: Arc<SeverityCounters>,
    pipeline: PipelineSender,
}

impl SamplerLoop {
    fn run(mut self) {
        log::info!("sampling loop started ({})", self.source.describe());
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.fatal_persist.load(Ordering::Acquire) {
                log::error!("persistence reported a fatal failure, stopping");
                self.state.set(EngineState::Error, &self.bus);
                break;
            }

            match self.source.next_sample() {
                Ok(Some(sample)) => self.process(sample),
                Ok(None) => {
                    log::info!("sample source exhausted, stopping");
                    self.state.set(EngineState::Stopped, &self.bus);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    log::error!("fatal sampler failure: {}", e);
                    self.state.set(EngineState::Error, &self.bus);
                    break;
                }
                Err(e) => {
                    log::warn!("skipping unreadable sample: {}", e);
                }
            }
        }
        log::info!("sampling loop stopped");
    }

    fn process(&mut self, sample: MetricSample) {
        self.store.append_sample(sample.clone());
        let sample_count = self.store.sample_count();

        if self.detector.wants_initial_fit(sample_count) {
            self.state.set(EngineState::Training, &self.bus);
            match self.detector.fit_initial(&self.store, sample.timestamp) {
                Ok(()) => self.state.set(EngineState::Ready, &self.bus),
                Err(e) => {
                    // Retried on the next tick once the buffer changes.
                    log::warn!("initial fit failed: {}", e);
                    self.state.set(EngineState::Cold, &self.bus);
                }
            }
        } else if self.detector.wants_retrain(sample.timestamp, sample_count) {
            self.detector.spawn_retrain(&self.store, sample.timestamp);
        }

        let (is_anomaly, raw_score, record) = match self.detector.score(&sample) {
            Some(score) => {
                let (severity, record) = classifier::classify(&sample, score);
                self.severity.increment(severity);
                if let Some(ref record) = record {
                    self.store.append_anomaly(record.clone());
                }
                (score.is_anomaly, Some(score.raw_score), record)
            }
            None => (false, None, None),
        };

        self.pipeline.dispatch(TickOutput {
            sample,
            is_anomaly,
            raw_score,
            record,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::sampler::ScriptedSource;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn test_config(dir: &tempfile::TempDir, min_training: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.min_training_samples = Some(min_training);
        config.samples_log_path = dir.path().join("metrics_history.csv");
        config.anomalies_log_path = dir.path().join("anomalies.jsonl");
        config.shutdown_deadline_seconds = 5;
        config
    }

    fn jittered_sample(i: i64) -> MetricSample {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let f = i as f64;
        MetricSample {
            timestamp: base + ChronoDuration::seconds(i),
            cpu_percent: 10.0 + (f % 10.0) * 0.3,
            cpu_frequency_mhz: 2400.0 + (f % 8.0) * 10.0,
            memory_percent: 20.0 + ((f * 3.0) % 7.0) * 0.2,
            memory_available_gb: 12.0,
            disk_read_mb_per_s: 0.5 + ((f * 5.0) % 11.0) * 0.05,
            disk_write_mb_per_s: 0.5 + ((f * 7.0) % 13.0) * 0.04,
            network_sent_mb_per_s: 0.5 + ((f * 2.0) % 9.0) * 0.06,
            network_recv_mb_per_s: 0.5 + ((f * 4.0) % 5.0) * 0.05,
        }
    }

    #[test]
    fn test_cold_engine_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 60);
        let samples: Vec<MetricSample> = (0..30).map(jittered_sample).collect();

        let engine =
            TelemetryEngine::start_with_source(config, Box::new(ScriptedSource::new(samples)))
                .unwrap();
        let state = engine.wait_for_terminal(Duration::from_secs(10));
        assert_eq!(state, EngineState::Stopped);

        let stats = engine.stats();
        assert_eq!(stats.sample_count, 30);
        assert_eq!(stats.anomaly_count, 0);
        assert!(stats.trained_at.is_none());

        let snapshot = engine.snapshot(100, 100);
        assert_eq!(snapshot.samples.len(), 30);
        assert!(snapshot.anomalies.is_empty());
        for pair in snapshot.samples.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }

        assert_eq!(engine.shutdown(), EngineState::Stopped);
    }

    #[test]
    fn test_engine_becomes_ready_after_training_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 30);
        let samples: Vec<MetricSample> = (0..45).map(jittered_sample).collect();

        let engine =
            TelemetryEngine::start_with_source(config, Box::new(ScriptedSource::new(samples)))
                .unwrap();
        engine.wait_for_terminal(Duration::from_secs(10));

        let stats = engine.stats();
        assert!(stats.trained_at.is_some());
        assert_eq!(stats.model_sample_count, Some(30));
        // Samples 30..=45 were scored; none of the quiet ticks is critical.
        assert_eq!(stats.severity_totals.critical, 0);

        engine.shutdown();
    }

    #[test]
    fn test_baseline_then_spike_reports_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 120);

        let mut samples: Vec<MetricSample> = (0..120).map(jittered_sample).collect();
        let mut spike = jittered_sample(120);
        spike.cpu_percent = 99.0;
        spike.memory_percent = 95.0;
        spike.disk_read_mb_per_s = 200.0;
        spike.network_sent_mb_per_s = 200.0;
        samples.push(spike.clone());

        let engine =
            TelemetryEngine::start_with_source(config, Box::new(ScriptedSource::new(samples)))
                .unwrap();
        let state = engine.wait_for_terminal(Duration::from_secs(10));
        assert_eq!(state, EngineState::Stopped);

        let snapshot = engine.snapshot(1000, 100);
        assert_eq!(snapshot.stats.anomaly_count, 1, "expected one reported anomaly");
        let record = &snapshot.anomalies[0];
        assert!(record.severity.is_reportable());
        assert!(record.raw_score < -0.5, "raw_score was {}", record.raw_score);
        assert_eq!(record.sample.timestamp, spike.timestamp);
        for reason in ["high CPU", "high memory", "disk burst", "network burst"] {
            assert!(
                record.reasons.contains(&reason.to_string()),
                "missing reason {:?} in {:?}",
                reason,
                record.reasons
            );
        }

        engine.shutdown();

        // Every sample reached the log, in order, before shutdown returned.
        let content =
            std::fs::read_to_string(dir.path().join("metrics_history.csv")).unwrap();
        assert_eq!(content.lines().count(), 1 + 121);
        let anomalies =
            std::fs::read_to_string(dir.path().join("anomalies.jsonl")).unwrap();
        assert_eq!(anomalies.lines().count(), 1);
    }

    #[test]
    fn test_subscription_sees_anomaly_and_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 60);

        let mut samples: Vec<MetricSample> = (0..60).map(jittered_sample).collect();
        let mut spike = jittered_sample(60);
        spike.cpu_percent = 99.0;
        spike.memory_percent = 95.0;
        spike.disk_read_mb_per_s = 200.0;
        spike.network_sent_mb_per_s = 200.0;
        samples.push(spike);

        // Paced source: the subscription below is registered long before
        // the terminal events are published.
        let source = ScriptedSource::with_delay(samples, Duration::from_millis(2));
        let engine = TelemetryEngine::start_with_source(config, Box::new(source)).unwrap();
        let sub = engine.subscribe(512);
        engine.wait_for_terminal(Duration::from_secs(10));
        engine.shutdown();

        let mut saw_anomaly = false;
        let mut saw_stopped = false;
        while let Some(event) = sub.try_recv() {
            match event {
                BusEvent::AnomalyReport { record } => {
                    saw_anomaly = true;
                    assert!(record.raw_score < -0.5);
                }
                BusEvent::StateUpdate { state } => {
                    if state == EngineState::Stopped {
                        saw_stopped = true;
                    }
                }
                BusEvent::SampleUpdate { .. } => {}
            }
        }
        assert!(saw_anomaly, "anomaly report never reached the subscriber");
        assert!(saw_stopped, "stopped state never reached the subscriber");
    }

    #[test]
    fn test_shutdown_is_idempotent_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 60);
        let engine = TelemetryEngine::start_with_source(
            config,
            Box::new(ScriptedSource::new(Vec::new())),
        )
        .unwrap();
        assert_eq!(engine.shutdown(), EngineState::Stopped);
    }
}
