//! Sampling sources: the live OS-counter sampler and the scripted source.
//!
//! Every source emits one `MetricSample` per call to `next_sample`, blocking
//! until the next tick boundary where that applies. The live sampler reads
//! CPU, memory, disk, and network counters through `sysinfo` and derives
//! per-second rates from the cumulative byte counters.

use crate::error::SamplerError;
use crate::metrics::rates::RateTracker;
use crate::metrics::MetricSample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};

/// A pluggable producer of metric samples.
///
/// `Ok(None)` means the source is exhausted (replay reached end of input);
/// the engine then stops cleanly. Live sources never return `Ok(None)`.
pub trait SampleSource: Send {
    fn next_sample(&mut self) -> Result<Option<MetricSample>, SamplerError>;

    /// Short human-readable description for startup logging.
    fn describe(&self) -> String;
}

/// Live sampler over OS performance counters.
///
/// Owns the `sysinfo` handles and a `RateTracker` per cumulative counter
/// stream. Ticks are scheduled against a fixed start instant so the cadence
/// does not drift with per-tick processing time.
pub struct LiveSampler {
    system: System,
    disks: Disks,
    networks: Networks,
    period: Duration,
    next_tick: Instant,
    last_refresh: Option<Instant>,
    last_timestamp: Option<DateTime<Utc>>,
    disk_read: RateTracker,
    disk_write: RateTracker,
    net_sent: RateTracker,
    net_recv: RateTracker,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl LiveSampler {
    pub fn new(period: Duration, max_consecutive_failures: u32) -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        LiveSampler {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            period,
            next_tick: Instant::now() + period,
            last_refresh: None,
            last_timestamp: None,
            disk_read: RateTracker::new(),
            disk_write: RateTracker::new(),
            net_sent: RateTracker::new(),
            net_recv: RateTracker::new(),
            consecutive_failures: 0,
            max_consecutive_failures,
        }
    }

    /// Sleep until the next tick boundary. Missed boundaries are skipped
    /// rather than replayed in a burst.
    fn wait_for_tick(&mut self) {
        let now = Instant::now();
        if self.next_tick > now {
            std::thread::sleep(self.next_tick - now);
        }
        self.next_tick += self.period;
        let now = Instant::now();
        while self.next_tick <= now {
            self.next_tick += self.period;
        }
    }

    /// Timestamp for the sample being built, strictly greater than the
    /// previous one even if the wall clock stalls or steps backwards.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut ts = Utc::now();
        if let Some(last) = self.last_timestamp {
            if ts <= last {
                ts = last + ChronoDuration::milliseconds(1);
            }
        }
        self.last_timestamp = Some(ts);
        ts
    }

    fn read_counters(&mut self) -> MetricSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.networks.refresh(true);

        let elapsed = match self.last_refresh.replace(Instant::now()) {
            Some(prev) => prev.elapsed().as_secs_f64(),
            None => 0.0,
        };

        let timestamp = self.next_timestamp();
        let mut sample = MetricSample::zeroed(timestamp);

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            log::warn!("CPU counters unavailable this tick, emitting zeros");
        } else {
            sample.cpu_percent = f64::from(self.system.global_cpu_usage());
            let total_mhz: u64 = cpus.iter().map(|cpu| cpu.frequency()).sum();
            sample.cpu_frequency_mhz = total_mhz as f64 / cpus.len() as f64;
        }

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            log::warn!("memory counters unavailable this tick, emitting zeros");
        } else {
            let used = self.system.used_memory();
            sample.memory_percent = used as f64 / total_memory as f64 * 100.0;
            sample.memory_available_gb =
                self.system.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        }

        let mut disk_read_total: u64 = 0;
        let mut disk_write_total: u64 = 0;
        for disk in self.disks.list() {
            let usage = disk.usage();
            disk_read_total = disk_read_total.saturating_add(usage.total_read_bytes);
            disk_write_total = disk_write_total.saturating_add(usage.total_written_bytes);
        }
        sample.disk_read_mb_per_s = self.disk_read.update(disk_read_total, elapsed);
        sample.disk_write_mb_per_s = self.disk_write.update(disk_write_total, elapsed);

        let mut net_sent_total: u64 = 0;
        let mut net_recv_total: u64 = 0;
        for (_name, data) in &self.networks {
            net_sent_total = net_sent_total.saturating_add(data.total_transmitted());
            net_recv_total = net_recv_total.saturating_add(data.total_received());
        }
        sample.network_sent_mb_per_s = self.net_sent.update(net_sent_total, elapsed);
        sample.network_recv_mb_per_s = self.net_recv.update(net_recv_total, elapsed);

        // A host where every counter family reads empty is a dead sampling
        // subsystem, not a transient hiccup.
        if cpus.is_empty() && total_memory == 0 {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        sample.sanitize()
    }
}

impl SampleSource for LiveSampler {
    fn next_sample(&mut self) -> Result<Option<MetricSample>, SamplerError> {
        self.wait_for_tick();
        let sample = self.read_counters();
        if self.consecutive_failures >= self.max_consecutive_failures {
            return Err(SamplerError::Fatal(format!(
                "no OS counters readable for {} consecutive ticks",
                self.consecutive_failures
            )));
        }
        Ok(Some(sample))
    }

    fn describe(&self) -> String {
        format!("live OS counters at {:?} period", self.period)
    }
}

/// In-memory source over a prepared sequence of samples.
///
/// Used by tests and by data-generation shells; emits rows immediately
/// without waiting for tick boundaries.
pub struct ScriptedSource {
    samples: VecDeque<MetricSample>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new(samples: Vec<MetricSample>) -> Self {
        ScriptedSource {
            samples: samples.into(),
            delay: None,
        }
    }

    /// Pace emission with a fixed delay per sample, approximating a tick
    /// clock without wall-clock-scale test runtimes.
    pub fn with_delay(samples: Vec<MetricSample>, delay: Duration) -> Self {
        ScriptedSource {
            samples: samples.into(),
            delay: Some(delay),
        }
    }
}

impl SampleSource for ScriptedSource {
    fn next_sample(&mut self) -> Result<Option<MetricSample>, SamplerError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self.samples.pop_front())
    }

    fn describe(&self) -> String {
        format!("scripted source ({} samples)", self.samples.len())
    }
}
