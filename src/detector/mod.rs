//! Detector: owns the current model and decides when to (re)train.
//!
//! The model lives behind a shared pointer that is replaced atomically when
//! a fit completes; scoring takes the pointer once per call and never holds
//! a lock across the model's own work. Retraining runs on a background
//! thread over a copied training slice, so the sampling loop keeps scoring
//! against the previous model while a fit is in progress.
//!
//! Retrain scheduling is driven by sample timestamps rather than the wall
//! clock, which keeps replay runs deterministic.

pub mod forest;

use crate::config::EngineConfig;
use crate::error::DetectorError;
use crate::metrics::{FeatureVector, MetricSample};
use crate::store::RollingStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub use forest::{ForestConfig, IsolationForest, Score};

/// Shared slot holding the current model; `None` until the first fit.
pub type ModelSlot = Arc<RwLock<Option<Arc<IsolationForest>>>>;

pub struct Detector {
    forest_config: ForestConfig,
    min_training_samples: usize,
    retrain_interval: ChronoDuration,
    /// Retrains use the most recent `retrain_window` samples so the model
    /// drifts with recent behavior.
    retrain_window: usize,
    retrain_soft_deadline: Duration,
    model: ModelSlot,
    fit_in_progress: Arc<AtomicBool>,
}

impl Detector {
    pub fn new(config: &EngineConfig) -> Self {
        let min_training_samples = config.effective_min_training_samples();
        let retrain_window = min_training_samples
            .saturating_mul(config.retrain_window_multiplier)
            .min(config.samples_buffer_size);
        Detector {
            forest_config: ForestConfig {
                trees: config.forest_trees,
                subsample: forest::DEFAULT_SUBSAMPLE,
                contamination: config.contamination,
                seed: config.model_seed,
            },
            min_training_samples,
            retrain_interval: ChronoDuration::seconds(config.retrain_interval_seconds as i64),
            retrain_window,
            retrain_soft_deadline: Duration::from_secs(config.retrain_interval_seconds.max(2) / 2),
            model: Arc::new(RwLock::new(None)),
            fit_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle to the model pointer, used by the stats surface.
    pub fn model_slot(&self) -> ModelSlot {
        Arc::clone(&self.model)
    }

    pub fn is_ready(&self) -> bool {
        self.model.read().unwrap().is_some()
    }

    pub fn min_training_samples(&self) -> usize {
        self.min_training_samples
    }

    /// Timestamp of the fit that produced the current model.
    pub fn trained_at(&self) -> Option<DateTime<Utc>> {
        self.model
            .read()
            .unwrap()
            .as_ref()
            .map(|model| model.trained_at())
    }

    /// True once the cold window has filled and no model exists yet.
    pub fn wants_initial_fit(&self, sample_count: u64) -> bool {
        !self.is_ready() && sample_count >= self.min_training_samples as u64
    }

    /// Fit on the full current buffer. Called inline from the sampling loop
    /// at the cold-to-ready transition; a failure leaves the detector cold
    /// and is retried on the next tick.
    pub fn fit_initial(
        &self,
        store: &RollingStore,
        as_of: DateTime<Utc>,
    ) -> Result<(), DetectorError> {
        let window = store.recent_samples(store.samples_capacity());
        self.fit_window(&window, as_of)
    }

    /// Score one sample against the current model.
    ///
    /// Takes the model pointer once; the lock is not held during scoring.
    pub fn score(&self, sample: &MetricSample) -> Option<Score> {
        let model = self.model.read().unwrap().clone()?;
        Some(model.score(&sample.features()))
    }

    /// True when the model is stale enough to schedule a retrain.
    pub fn wants_retrain(&self, as_of: DateTime<Utc>, sample_count: u64) -> bool {
        if self.fit_in_progress.load(Ordering::Acquire) {
            return false;
        }
        if sample_count < self.min_training_samples as u64 {
            return false;
        }
        match self.trained_at() {
            Some(trained_at) => as_of - trained_at >= self.retrain_interval,
            None => false,
        }
    }

    /// Kick off a background retrain over a copied slice of recent samples.
    ///
    /// The previous model keeps serving scores until the new one is swapped
    /// in. Returns false if a fit is already running.
    pub fn spawn_retrain(&self, store: &RollingStore, as_of: DateTime<Utc>) -> bool {
        if self
            .fit_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let window = store.recent_samples(self.retrain_window);
        let features: Vec<FeatureVector> = window.iter().map(|s| s.features()).collect();
        let forest_config = self.forest_config;
        let model = Arc::clone(&self.model);
        let in_progress = Arc::clone(&self.fit_in_progress);
        let soft_deadline = self.retrain_soft_deadline;

        let spawned = std::thread::Builder::new()
            .name("syswatch-retrain".to_string())
            .spawn(move || {
                let started = Instant::now();
                match IsolationForest::fit(&features, &forest_config, as_of) {
                    Ok(forest) => {
                        let elapsed = started.elapsed();
                        if elapsed > soft_deadline {
                            log::warn!(
                                "retrain took {:?}, exceeding the soft deadline of {:?}",
                                elapsed,
                                soft_deadline
                            );
                        }
                        *model.write().unwrap() = Some(Arc::new(forest));
                        log::info!(
                            "model retrained on {} samples as of {}",
                            features.len(),
                            as_of
                        );
                    }
                    Err(e) => {
                        log::warn!("retrain failed, keeping previous model: {}", e);
                    }
                }
                in_progress.store(false, Ordering::Release);
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                log::error!("failed to spawn retrain thread: {}", e);
                self.fit_in_progress.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Synchronous retrain used by the replay analyzer, where background
    /// threads would break row-by-row determinism.
    pub fn retrain_blocking(
        &self,
        store: &RollingStore,
        as_of: DateTime<Utc>,
    ) -> Result<(), DetectorError> {
        let window = store.recent_samples(self.retrain_window);
        self.fit_window(&window, as_of)
    }

    fn fit_window(
        &self,
        window: &[MetricSample],
        as_of: DateTime<Utc>,
    ) -> Result<(), DetectorError> {
        let features: Vec<FeatureVector> = window.iter().map(|s| s.features()).collect();
        let forest = IsolationForest::fit(&features, &self.forest_config, as_of)?;
        log::info!("model fitted on {} samples as of {}", features.len(), as_of);
        *self.model.write().unwrap() = Some(Arc::new(forest));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config_with_window(min_samples: usize, retrain_secs: u64) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.min_training_samples = Some(min_samples);
        config.retrain_interval_seconds = retrain_secs;
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

    fn filled_store(n: i64) -> RollingStore {
        let store = RollingStore::new(1000, 100);
        for i in 0..n {
            store.append_sample(jittered_sample(i));
        }
        store
    }

    #[test]
    fn test_cold_until_window_fills() {
        let detector = Detector::new(&config_with_window(60, 300));
        assert!(!detector.is_ready());
        assert!(!detector.wants_initial_fit(59));
        assert!(detector.wants_initial_fit(60));
        assert!(detector.score(&jittered_sample(0)).is_none());
    }

    #[test]
    fn test_initial_fit_transitions_to_ready() {
        let detector = Detector::new(&config_with_window(60, 300));
        let store = filled_store(60);
        let as_of = jittered_sample(59).timestamp;

        detector.fit_initial(&store, as_of).unwrap();
        assert!(detector.is_ready());
        assert_eq!(detector.trained_at(), Some(as_of));
        assert!(detector.score(&jittered_sample(60)).is_some());
        assert!(!detector.wants_initial_fit(61));
    }

    #[test]
    fn test_fit_failure_stays_cold() {
        let detector = Detector::new(&config_with_window(10, 300));
        let store = RollingStore::new(1000, 100);
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        for i in 0..10 {
            // All-constant window: no feature can be split.
            store.append_sample(MetricSample::zeroed(base + ChronoDuration::seconds(i)));
        }

        let result = detector.fit_initial(&store, base);
        assert!(matches!(
            result,
            Err(DetectorError::DegenerateTrainingData { .. })
        ));
        assert!(!detector.is_ready());
    }

    #[test]
    fn test_retrain_scheduling_by_sample_time() {
        let detector = Detector::new(&config_with_window(10, 10));
        let store = filled_store(10);
        let fitted_at = jittered_sample(9).timestamp;
        detector.fit_initial(&store, fitted_at).unwrap();

        assert!(!detector.wants_retrain(fitted_at + ChronoDuration::seconds(9), 20));
        assert!(detector.wants_retrain(fitted_at + ChronoDuration::seconds(10), 20));
        // Not enough samples blocks a retrain regardless of staleness.
        assert!(!detector.wants_retrain(fitted_at + ChronoDuration::seconds(60), 5));
    }

    #[test]
    fn test_background_retrain_advances_trained_at() {
        let detector = Detector::new(&config_with_window(10, 10));
        let store = filled_store(40);
        let fitted_at = jittered_sample(9).timestamp;
        detector.fit_initial(&store, fitted_at).unwrap();

        let retrain_at = fitted_at + ChronoDuration::seconds(30);
        assert!(detector.spawn_retrain(&store, retrain_at));

        let deadline = Instant::now() + Duration::from_secs(5);
        while detector.trained_at() != Some(retrain_at) {
            assert!(Instant::now() < deadline, "retrain did not complete");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(detector.is_ready());
    }

    #[test]
    fn test_overlapping_retrains_not_scheduled() {
        let detector = Detector::new(&config_with_window(10, 10));
        detector.fit_in_progress.store(true, Ordering::Release);
        let later = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        assert!(!detector.wants_retrain(later, 100));
    }
}
