//! syswatch: host-resident telemetry engine with online anomaly detection.
//!
//! The engine samples OS performance counters at a fixed cadence, learns a
//! statistical model of normal behavior online, and flags samples that
//! deviate from that model. External transports (dashboards, websockets)
//! integrate through three contracts: a pluggable sampling source, a
//! subscription surface for live events, and a snapshot surface for initial
//! state.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **config**: Runtime configuration with validated defaults
//! - **metrics**: Sample types, sampling sources, rate derivation, replay
//! - **store**: Bounded rolling buffers with snapshot semantics
//! - **detector**: Isolation-forest model and its retraining lifecycle
//! - **classifier**: Severity bands and rule-based reasons
//! - **bus**: Bounded drop-from-head fan-out to live subscribers
//! - **persist**: Append-only sample and anomaly logs off the hot path
//! - **engine**: Lifecycle, the sampling loop, and the query surface

pub mod bus;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persist;
pub mod store;

// Re-export the log crate for macro usage
pub use log;

pub use bus::{BusEvent, EventBus, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use config::EngineConfig;
pub use detector::{Detector, ForestConfig, IsolationForest, Score};
pub use engine::{EngineSnapshot, EngineStats, SeverityTotals, TelemetryEngine};
pub use error::{ConfigError, DetectorError, EngineError, PersistError, Result, SamplerError};
pub use metrics::replay::{ReplayAnalyzer, ReplayReport, ReplaySource};
pub use metrics::sampler::{LiveSampler, SampleSource, ScriptedSource};
pub use metrics::{AnomalyRecord, EngineState, MetricSample, Severity};
pub use store::RollingStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
