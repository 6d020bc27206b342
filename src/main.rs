//! Thin CLI shell around the telemetry engine.
//!
//! Usage: `syswatch [config.toml]`. Exit codes: 0 on normal shutdown, 1 on
//! an unrecoverable engine error, 2 on invalid configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use syswatch::{
    EngineConfig, EngineState, ReplayAnalyzer, ReplaySource, TelemetryEngine,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match EngineConfig::load_or_default(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    // A configured replay output means file-to-file analysis, no live engine.
    if config.replay_output_path.is_some() {
        return run_replay_analysis(config);
    }

    let engine = match start_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("failed to start engine: {}", e);
            return ExitCode::from(1);
        }
    };
    log::info!("syswatch {} running", syswatch::VERSION);

    // Wait for ctrl-c or for the engine to reach a terminal state on its
    // own (fatal failure, exhausted replay input).
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("failed to listen for shutdown signal: {}", e);
                }
                log::info!("shutdown signal received");
                break;
            }
            _ = poll.tick() => {
                if matches!(engine.state(), EngineState::Stopped | EngineState::Error) {
                    break;
                }
            }
        }
    }

    let final_state = tokio::task::spawn_blocking(move || engine.shutdown())
        .await
        .unwrap_or(EngineState::Error);
    match final_state {
        EngineState::Error => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    }
}

fn start_engine(config: &EngineConfig) -> syswatch::Result<TelemetryEngine> {
    match &config.replay_input_path {
        Some(input) => {
            log::info!("replaying historical table {}", input.display());
            let source = ReplaySource::open(input, config.sample_period())?;
            TelemetryEngine::start_with_source(config.clone(), Box::new(source))
        }
        None => TelemetryEngine::start(config.clone()),
    }
}

fn run_replay_analysis(config: EngineConfig) -> ExitCode {
    let analyzer = match ReplayAnalyzer::new(config) {
        Ok(analyzer) => analyzer,
        Err(e) => {
            log::error!("invalid replay configuration: {}", e);
            return ExitCode::from(2);
        }
    };
    match analyzer.run() {
        Ok(report) => {
            log::info!(
                "analyzed {} rows: {} flagged, {} reportable",
                report.rows,
                report.flagged,
                report.reported
            );
            ExitCode::SUCCESS
        }
        Err(syswatch::EngineError::Config(e)) => {
            log::error!("invalid replay configuration: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            log::error!("replay analysis failed: {}", e);
            ExitCode::from(1)
        }
    }
}
