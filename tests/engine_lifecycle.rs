//! Integration tests for the engine lifecycle over the public API
//!
//! Tests:
//! 1. State transitions are observable through a subscription
//! 2. Snapshot surface respects the rolling-buffer bounds
//! 3. Slow subscribers lose oldest events, never block the engine
//! 4. Shutdown completes within the configured deadline

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::time::{Duration, Instant};
use syswatch::{
    BusEvent, EngineConfig, EngineState, MetricSample, ScriptedSource, TelemetryEngine,
};

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

fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.samples_log_path = dir.path().join("metrics_history.csv");
    config.anomalies_log_path = dir.path().join("anomalies.jsonl");
    config
}

#[test]
fn test_state_transitions_visible_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.min_training_samples = Some(20);

    let samples: Vec<MetricSample> = (0..30).map(jittered_sample).collect();
    let source = ScriptedSource::with_delay(samples, Duration::from_millis(2));
    let engine = TelemetryEngine::start_with_source(config, Box::new(source)).unwrap();
    let sub = engine.subscribe(256);

    assert_eq!(
        engine.wait_for_terminal(Duration::from_secs(10)),
        EngineState::Stopped
    );
    engine.shutdown();

    let mut states = Vec::new();
    while let Some(event) = sub.try_recv() {
        if let BusEvent::StateUpdate { state } = event {
            states.push(state);
        }
    }
    println!("[TEST] observed state transitions: {:?}", states);
    assert!(states.contains(&EngineState::Training));
    assert!(states.contains(&EngineState::Ready));
    assert!(states.contains(&EngineState::Stopped));
    println!("[TEST] ✓ Training, Ready, and Stopped all reached subscribers");
}

#[test]
fn test_snapshot_respects_buffer_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.samples_buffer_size = 50;
    config.min_training_samples = Some(1000);

    let samples: Vec<MetricSample> = (0..80).map(jittered_sample).collect();
    let engine =
        TelemetryEngine::start_with_source(config, Box::new(ScriptedSource::new(samples))).unwrap();
    engine.wait_for_terminal(Duration::from_secs(10));

    let snapshot = engine.snapshot(10_000, 10_000);
    assert_eq!(snapshot.samples.len(), 50);
    assert_eq!(snapshot.stats.sample_count, 80);
    // The retained window is the most recent 50 samples, in order.
    assert_eq!(
        snapshot.samples.first().unwrap().timestamp,
        jittered_sample(30).timestamp
    );
    assert_eq!(
        snapshot.samples.last().unwrap().timestamp,
        jittered_sample(79).timestamp
    );
    println!("[TEST] ✓ snapshot capped at buffer capacity with oldest evicted");

    engine.shutdown();
}

#[test]
fn test_slow_subscriber_drops_oldest_without_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    // Default training window (60) is never reached: 30 samples produce
    // exactly 30 sample updates plus the final stopped state update.
    let samples: Vec<MetricSample> = (0..30).map(jittered_sample).collect();
    let source = ScriptedSource::with_delay(samples, Duration::from_millis(2));
    let engine = TelemetryEngine::start_with_source(config, Box::new(source)).unwrap();
    let sub = engine.subscribe(1);

    engine.wait_for_terminal(Duration::from_secs(10));
    engine.shutdown();

    let mut delivered = 0;
    while sub.try_recv().is_some() {
        delivered += 1;
    }
    println!(
        "[TEST] delivered={}, dropped={}",
        delivered,
        sub.drop_count()
    );
    assert_eq!(delivered, 1, "capacity-1 queue holds exactly one event");
    assert_eq!(sub.drop_count(), 30, "all older events dropped from head");
    println!("[TEST] ✓ burst of 31 events left 1 delivered and 30 drop-logs");
}

#[test]
fn test_shutdown_completes_within_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.shutdown_deadline_seconds = 5;

    // A long-running paced source the shutdown has to interrupt.
    let samples: Vec<MetricSample> = (0..10_000).map(jittered_sample).collect();
    let source = ScriptedSource::with_delay(samples, Duration::from_millis(10));
    let engine = TelemetryEngine::start_with_source(config, Box::new(source)).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    let state = engine.shutdown();
    let elapsed = started.elapsed();

    println!("[TEST] shutdown took {:?}, final state {}", elapsed, state);
    assert_eq!(state, EngineState::Stopped);
    assert!(elapsed < Duration::from_secs(5));
    println!("[TEST] ✓ graceful shutdown bounded by the deadline");
}
