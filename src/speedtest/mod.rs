pub mod download;
pub mod engine;
pub mod error;
pub mod ping;
pub mod report;
pub mod retry;
pub mod stats;
pub mod transport;
pub mod upload;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub use engine::{PhaseAccumulator, SpeedTest, TestState, TestUpdate};
pub use error::{PhaseParseError, SpeedTestError, TransportError};
pub use report::SpeedTestResult;
pub use retry::RetryPolicy;
pub use transport::{ClientInfo, HttpTransport, ProbeResponse, Transport};

/// Phase min duration (ms) above which a direction is considered characterized.
pub const BANDWIDTH_FINISH_REQUEST_DURATION_MS: f64 = 1000.0;
/// Samples faster than this (ms) are treated as noise and never aggregated.
pub const BANDWIDTH_MIN_REQUEST_DURATION_MS: f64 = 10.0;
pub const LATENCY_PERCENTILE: f64 = 0.5;
/// Size of the dedicated latency phase; the report prefers its samples.
pub const LATENCY_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Latency,
    Download,
    Upload,
}

impl PhaseKind {
    pub fn direction(self) -> Option<Direction> {
        match self {
            PhaseKind::Latency => None,
            PhaseKind::Download => Some(Direction::Download),
            PhaseKind::Upload => Some(Direction::Upload),
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseKind::Latency => write!(f, "latency"),
            PhaseKind::Download => write!(f, "download"),
            PhaseKind::Upload => write!(f, "upload"),
        }
    }
}

/// One row of the measurement table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeasurementPhase {
    pub kind: PhaseKind,
    pub bytes: u64,
    pub count: usize,
    pub bypass_min_duration: bool,
}

impl MeasurementPhase {
    pub const fn latency(count: usize) -> Self {
        Self {
            kind: PhaseKind::Latency,
            bytes: 0,
            count,
            bypass_min_duration: false,
        }
    }

    pub const fn download(bytes: u64, count: usize) -> Self {
        Self {
            kind: PhaseKind::Download,
            bytes,
            count,
            bypass_min_duration: false,
        }
    }

    pub const fn upload(bytes: u64, count: usize) -> Self {
        Self {
            kind: PhaseKind::Upload,
            bytes,
            count,
            bypass_min_duration: false,
        }
    }

    pub const fn bypass(mut self) -> Self {
        self.bypass_min_duration = true;
        self
    }
}

impl fmt::Display for MeasurementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.bytes, self.count)?;
        if self.bypass_min_duration {
            write!(f, ":bypass")?;
        }
        Ok(())
    }
}

/// Parses `kind:bytes:count[:bypass]`, e.g. `download:100000:1:bypass`.
impl FromStr for MeasurementPhase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(PhaseParseError::Format(s.to_string()));
        }

        let kind = match parts[0].to_ascii_lowercase().as_str() {
            "latency" | "ping" => PhaseKind::Latency,
            "download" | "down" => PhaseKind::Download,
            "upload" | "up" => PhaseKind::Upload,
            other => return Err(PhaseParseError::Kind(other.to_string())),
        };
        let bytes: u64 = parts[1]
            .replace('_', "")
            .parse()
            .map_err(|_| PhaseParseError::Number(parts[1].to_string()))?;
        let count: usize = parts[2]
            .parse()
            .map_err(|_| PhaseParseError::Number(parts[2].to_string()))?;
        if count == 0 {
            return Err(PhaseParseError::ZeroCount);
        }
        let bypass_min_duration = match parts.get(3) {
            None => false,
            Some(flag) if flag.eq_ignore_ascii_case("bypass") => true,
            Some(flag) => return Err(PhaseParseError::Flag(flag.to_string())),
        };

        Ok(Self {
            kind,
            bytes,
            count,
            bypass_min_duration,
        })
    }
}

/// Comma-separated phase list, used to override the default table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable(pub Vec<MeasurementPhase>);

impl FromStr for PhaseTable {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phases = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<MeasurementPhase>, _>>()?;
        if phases.is_empty() {
            return Err(PhaseParseError::Empty);
        }
        Ok(Self(phases))
    }
}

/// The standard sequence: calibration, latency, then growing payloads.
pub fn default_phases() -> Vec<MeasurementPhase> {
    vec![
        MeasurementPhase::latency(1),
        MeasurementPhase::download(100_000, 1).bypass(),
        MeasurementPhase::latency(20),
        MeasurementPhase::download(100_000, 9),
        MeasurementPhase::download(1_000_000, 8),
        MeasurementPhase::upload(100_000, 8),
        MeasurementPhase::upload(1_000_000, 6),
        MeasurementPhase::download(10_000_000, 6),
        MeasurementPhase::upload(10_000_000, 4),
        MeasurementPhase::download(25_000_000, 4),
        MeasurementPhase::upload(25_000_000, 4),
        MeasurementPhase::download(100_000_000, 3),
        MeasurementPhase::upload(50_000_000, 3),
        MeasurementPhase::download(250_000_000, 2),
    ]
}

/// A single successful bandwidth measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Bytes actually requested, after any adaptive shrinking.
    pub bytes: u64,
    pub bps: f64,
    pub duration_ms: f64,
    pub ping_ms: f64,
}

impl ProbeResult {
    pub fn mbps(&self) -> f64 {
        self.bps / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Idle,
    Ping,
    Download,
    Upload,
    Complete,
    Failed,
}

impl From<PhaseKind> for TestPhase {
    fn from(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::Latency => TestPhase::Ping,
            PhaseKind::Download => TestPhase::Download,
            PhaseKind::Upload => TestPhase::Upload,
        }
    }
}
