use super::engine::TestState;
use super::error::SpeedTestError;
use super::stats;
use super::transport::ClientInfo;
use super::{Direction, LATENCY_PERCENTILE, LATENCY_WINDOW};
use serde::Serialize;
use tracing::warn;

/// Below this many qualifying samples a bandwidth figure is reported but flagged.
const RELIABLE_SAMPLE_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestResult {
    pub download_bps: f64,
    pub upload_bps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub latency_samples: Vec<f64>,
    pub client: ClientInfo,
}

impl SpeedTestResult {
    pub fn download_mbps(&self) -> f64 {
        self.download_bps / 1_000_000.0
    }

    pub fn upload_mbps(&self) -> f64 {
        self.upload_bps / 1_000_000.0
    }

    pub fn download_bytes_per_sec(&self) -> f64 {
        self.download_bps / 8.0
    }

    pub fn upload_bytes_per_sec(&self) -> f64 {
        self.upload_bps / 8.0
    }
}

/// Reduces a finished run to its report. Fails rather than reporting a zero.
pub fn assemble(
    state: &TestState,
    client: ClientInfo,
    bandwidth_percentile: f64,
) -> Result<SpeedTestResult, SpeedTestError> {
    let download_bps = bandwidth(state, Direction::Download, bandwidth_percentile)?;
    let upload_bps = bandwidth(state, Direction::Upload, bandwidth_percentile)?;

    let latency = stats::latency_window(&state.latency_samples, LATENCY_WINDOW);
    if latency.is_empty() {
        return Err(SpeedTestError::NoLatencySamples);
    }

    Ok(SpeedTestResult {
        download_bps,
        upload_bps,
        ping_ms: stats::percentile(latency, LATENCY_PERCENTILE),
        jitter_ms: stats::jitter(latency),
        latency_samples: latency.to_vec(),
        client,
    })
}

fn bandwidth(
    state: &TestState,
    direction: Direction,
    percentile: f64,
) -> Result<f64, SpeedTestError> {
    let accumulator = state.accumulator(direction);
    let samples = stats::qualifying_bps(accumulator.results());
    if samples.is_empty() {
        return Err(SpeedTestError::MeasurementFailure {
            direction,
            attempted_sizes: accumulator.attempted_sizes().to_vec(),
            failed_sizes: accumulator.failed_sizes().to_vec(),
        });
    }
    if samples.len() < RELIABLE_SAMPLE_COUNT {
        warn!(
            %direction,
            samples = samples.len(),
            "Few successful measurements, result may be less accurate"
        );
    }
    Ok(stats::percentile(&samples, percentile))
}
