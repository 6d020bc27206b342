//! Conversion of cumulative byte counters into per-second MB rates.
//!
//! Disk and network counters from the OS are monotonically increasing totals.
//! Each tracker differences the current reading against the previous one and
//! normalizes by elapsed time. Counter wraps and resets never produce a
//! negative rate.

/// Bytes per MB (2^20) used when normalizing rates.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Tracks one cumulative counter stream and derives instantaneous rates.
#[derive(Clone, Debug, Default)]
pub struct RateTracker {
    prev_counter: Option<u64>,
    prev_rate: f64,
}

impl RateTracker {
    pub fn new() -> Self {
        RateTracker::default()
    }

    /// Feed the next counter reading and get the rate in MB/s.
    ///
    /// The first reading yields 0 (nothing to difference against). A counter
    /// that went backwards (wrap or reset) yields 0. A duplicate timestamp
    /// (`elapsed_seconds == 0`) repeats the previous rate.
    pub fn update(&mut self, counter: u64, elapsed_seconds: f64) -> f64 {
        let rate = match self.prev_counter {
            None => 0.0,
            Some(prev) => {
                if elapsed_seconds <= 0.0 || !elapsed_seconds.is_finite() {
                    return self.prev_rate;
                }
                let delta = counter.saturating_sub(prev);
                delta as f64 / elapsed_seconds / BYTES_PER_MB
            }
        };
        self.prev_counter = Some(counter);
        self.prev_rate = rate;
        rate
    }

    /// Rate produced by the most recent `update` call.
    pub fn last_rate(&self) -> f64 {
        self.prev_rate
    }
}
