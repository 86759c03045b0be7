//! Phase sequencer.
//!
//! Runs the measurement table strictly in order with exactly one request in
//! flight, so the client never competes with itself for bandwidth. All run
//! state lives in a [`TestState`] owned by the running future.

use super::download::DownloadTest;
use super::error::{SpeedTestError, TransportError};
use super::ping::PingTest;
use super::report::{self, SpeedTestResult};
use super::transport::{ClientInfo, Transport};
use super::upload::UploadTest;
use super::{Direction, MeasurementPhase, ProbeResult, BANDWIDTH_FINISH_REQUEST_DURATION_MS};
use crate::settings::Settings;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Per-direction samples, keyed by the phase's requested size. Each size keeps
/// only its most recent `count` results.
#[derive(Debug, Clone, Default)]
pub struct PhaseAccumulator {
    windows: BTreeMap<u64, VecDeque<ProbeResult>>,
    attempted: Vec<u64>,
    failed: Vec<u64>,
}

impl PhaseAccumulator {
    pub fn push(&mut self, size: u64, window: usize, result: ProbeResult) {
        let samples = self.windows.entry(size).or_default();
        samples.push_back(result);
        while samples.len() > window.max(1) {
            samples.pop_front();
        }
    }

    pub fn record_attempted(&mut self, size: u64) {
        if !self.attempted.contains(&size) {
            self.attempted.push(size);
        }
    }

    pub fn record_failed(&mut self, size: u64) {
        if !self.failed.contains(&size) {
            self.failed.push(size);
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &ProbeResult> {
        self.windows.values().flatten()
    }

    pub fn window(&self, size: u64) -> Option<&VecDeque<ProbeResult>> {
        self.windows.get(&size)
    }

    pub fn attempted_sizes(&self) -> &[u64] {
        &self.attempted
    }

    pub fn failed_sizes(&self) -> &[u64] {
        &self.failed
    }

    pub fn len(&self) -> usize {
        self.windows.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct TestState {
    /// Ping values in the order they were measured.
    pub latency_samples: Vec<f64>,
    pub download: PhaseAccumulator,
    pub upload: PhaseAccumulator,
    pub download_finished: bool,
    pub upload_finished: bool,
}

impl TestState {
    pub fn accumulator(&self, direction: Direction) -> &PhaseAccumulator {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    fn accumulator_mut(&mut self, direction: Direction) -> &mut PhaseAccumulator {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }

    pub fn is_finished(&self, direction: Direction) -> bool {
        match direction {
            Direction::Download => self.download_finished,
            Direction::Upload => self.upload_finished,
        }
    }

    fn finish(&mut self, direction: Direction) {
        match direction {
            Direction::Download => self.download_finished = true,
            Direction::Upload => self.upload_finished = true,
        }
    }
}

/// Live progress for front-ends. Delivery is best effort.
#[derive(Debug, Clone)]
pub enum TestUpdate {
    ClientInfo(ClientInfo),
    PhaseStarted {
        index: usize,
        phase: MeasurementPhase,
    },
    Latency {
        ping_ms: f64,
    },
    Sample {
        direction: Direction,
        result: ProbeResult,
    },
    Dropped {
        direction: Direction,
        size: u64,
        reason: String,
    },
    DirectionFinished(Direction),
}

pub struct SpeedTest<T> {
    transport: T,
    settings: Settings,
    progress: Option<mpsc::Sender<TestUpdate>>,
}

impl<T: Transport> SpeedTest<T> {
    pub fn new(transport: T, settings: Settings) -> Self {
        Self {
            transport,
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<TestUpdate>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Full run: client lookup, every phase, then the report.
    pub async fn run(&self) -> Result<SpeedTestResult, SpeedTestError> {
        info!(
            base_url = %self.settings.base_url,
            phases = self.settings.phases.len(),
            patience_secs = self.settings.patience.as_secs(),
            "Starting speed test (patience is advisory and not enforced)"
        );

        let client = self.client_info().await?;
        let state = self.run_phases().await?;
        let result = report::assemble(&state, client, self.settings.bandwidth_percentile())?;

        info!(
            download_mbps = result.download_mbps(),
            upload_mbps = result.upload_mbps(),
            ping_ms = result.ping_ms,
            jitter_ms = result.jitter_ms,
            "Speed test complete"
        );
        Ok(result)
    }

    /// Client identification never fails the run, except on a missing password.
    pub async fn client_info(&self) -> Result<ClientInfo, SpeedTestError> {
        let info = match self.transport.client_info().await {
            Ok(info) => info,
            Err(TransportError::Unauthorized) => return Err(SpeedTestError::Unauthorized),
            Err(err) => {
                debug!(error = %err, "getIP failed");
                ClientInfo::default()
            }
        };
        self.emit(TestUpdate::ClientInfo(info.clone())).await;
        Ok(info)
    }

    pub async fn run_phases(&self) -> Result<TestState, SpeedTestError> {
        let mut state = TestState::default();
        let mut previous_size: Option<u64> = None;
        let mut calibrated = false;

        for (index, phase) in self.settings.phases.iter().enumerate() {
            let direction = phase.kind.direction();
            if let Some(direction) = direction {
                if state.is_finished(direction) {
                    debug!(index, %phase, "Skipping phase, direction finished");
                    continue;
                }
            }

            if let Some(previous) = previous_size {
                if previous != phase.bytes {
                    sleep(self.settings.phase_delay).await;
                }
            }
            previous_size = Some(phase.bytes);

            debug!(index, %phase, "Starting phase");
            self.emit(TestUpdate::PhaseStarted {
                index,
                phase: *phase,
            })
            .await;

            match direction {
                None => self.run_latency_phase(&mut state, phase).await?,
                Some(direction) => {
                    let calibration = direction == Direction::Download && !calibrated;
                    if calibration {
                        calibrated = true;
                    }
                    self.run_bandwidth_phase(&mut state, direction, phase, calibration)
                        .await?;
                }
            }
        }

        Ok(state)
    }

    async fn run_latency_phase(
        &self,
        state: &mut TestState,
        phase: &MeasurementPhase,
    ) -> Result<(), SpeedTestError> {
        let ping = PingTest::new(&self.transport);
        let mut dropped = 0;

        for _ in 0..phase.count {
            match ping.run().await? {
                Some(ping_ms) => {
                    state.latency_samples.push(ping_ms);
                    self.emit(TestUpdate::Latency { ping_ms }).await;
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(dropped, count = phase.count, "Latency probes failed");
        }
        Ok(())
    }

    async fn run_bandwidth_phase(
        &self,
        state: &mut TestState,
        direction: Direction,
        phase: &MeasurementPhase,
        calibration: bool,
    ) -> Result<(), SpeedTestError> {
        state.accumulator_mut(direction).record_attempted(phase.bytes);

        let mut min_duration = f64::INFINITY;
        let mut successes = 0;
        let mut last_error = None;

        for i in 0..phase.count {
            if i > 0 {
                sleep(self.settings.request_delay).await;
            }

            match self.probe(direction, phase.bytes).await {
                Ok(result) => {
                    successes += 1;
                    min_duration = min_duration.min(result.duration_ms);
                    state
                        .accumulator_mut(direction)
                        .push(phase.bytes, phase.count, result);
                    self.emit(TestUpdate::Sample { direction, result }).await;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(%direction, size = phase.bytes, error = %err, "Measurement dropped");
                    state.accumulator_mut(direction).record_failed(phase.bytes);
                    self.emit(TestUpdate::Dropped {
                        direction,
                        size: phase.bytes,
                        reason: err.to_string(),
                    })
                    .await;
                    last_error = Some(err);
                }
            }
        }

        if calibration && successes == 0 {
            if let Some(err) = last_error {
                return Err(SpeedTestError::CalibrationFailed(Box::new(err)));
            }
        }

        if successes < phase.count {
            warn!(
                %direction,
                size = phase.bytes,
                failed = phase.count - successes,
                count = phase.count,
                "Some requests failed"
            );
        }

        if !phase.bypass_min_duration
            && successes > 0
            && min_duration > BANDWIDTH_FINISH_REQUEST_DURATION_MS
        {
            info!(
                %direction,
                size = phase.bytes,
                min_duration_ms = min_duration,
                "Direction finished"
            );
            state.finish(direction);
            self.emit(TestUpdate::DirectionFinished(direction)).await;
        }

        Ok(())
    }

    async fn probe(&self, direction: Direction, bytes: u64) -> Result<ProbeResult, SpeedTestError> {
        let policy = &self.settings.retry;
        match direction {
            Direction::Download => DownloadTest::new(&self.transport, policy).run(bytes).await,
            Direction::Upload => UploadTest::new(&self.transport, policy).run(bytes).await,
        }
    }

    async fn emit(&self, update: TestUpdate) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(update).await;
        }
    }
}
