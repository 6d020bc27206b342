//! Bounded in-memory storage for recent samples and reported anomalies.
//!
//! The store is the only shared mutable collection in the engine. A single
//! mutex protects both buffers and is held only for the duration of a push
//! or a snapshot; snapshots copy out so readers always see a consistent
//! point-in-time view, independent of concurrent appends.

use crate::metrics::{AnomalyRecord, MetricSample};
use std::collections::VecDeque;
use std::sync::Mutex;

struct StoreInner {
    samples: VecDeque<MetricSample>,
    anomalies: VecDeque<AnomalyRecord>,
    /// Total samples appended since start, independent of eviction.
    total_samples: u64,
    /// Total reported anomalies appended since start.
    total_anomalies: u64,
}

/// Rolling buffers of the most recent N samples and M reported anomalies.
pub struct RollingStore {
    inner: Mutex<StoreInner>,
    samples_capacity: usize,
    anomalies_capacity: usize,
}

impl RollingStore {
    pub fn new(samples_capacity: usize, anomalies_capacity: usize) -> Self {
        RollingStore {
            inner: Mutex::new(StoreInner {
                samples: VecDeque::with_capacity(samples_capacity),
                anomalies: VecDeque::with_capacity(anomalies_capacity),
                total_samples: 0,
                total_anomalies: 0,
            }),
            samples_capacity,
            anomalies_capacity,
        }
    }

    /// Push a sample, evicting the oldest when the buffer is full.
    pub fn append_sample(&self, sample: MetricSample) {
        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() == self.samples_capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
        inner.total_samples += 1;
    }

    /// Push a reported anomaly, evicting the oldest when the buffer is full.
    pub fn append_anomaly(&self, record: AnomalyRecord) {
        let mut inner = self.inner.lock().unwrap();
        if inner.anomalies.len() == self.anomalies_capacity {
            inner.anomalies.pop_front();
        }
        inner.anomalies.push_back(record);
        inner.total_anomalies += 1;
    }

    /// Copy of the last `k` samples in append order (all if fewer).
    pub fn recent_samples(&self, k: usize) -> Vec<MetricSample> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.samples.len().saturating_sub(k);
        inner.samples.iter().skip(skip).cloned().collect()
    }

    /// Copy of the last `k` reported anomalies in append order.
    pub fn recent_anomalies(&self, k: usize) -> Vec<AnomalyRecord> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.anomalies.len().saturating_sub(k);
        inner.anomalies.iter().skip(skip).cloned().collect()
    }

    /// Total samples appended since start (monotonic, not the buffer size).
    pub fn sample_count(&self) -> u64 {
        self.inner.lock().unwrap().total_samples
    }

    /// Total reported anomalies appended since start.
    pub fn anomaly_count(&self) -> u64 {
        self.inner.lock().unwrap().total_anomalies
    }

    /// Number of samples currently buffered.
    pub fn buffered_samples(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn samples_capacity(&self) -> usize {
        self.samples_capacity
    }

    pub fn anomalies_capacity(&self) -> usize {
        self.anomalies_capacity
    }
}
