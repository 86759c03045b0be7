use super::Direction;
use thiserror::Error;

/// Failures below HTTP status handling: connect, timeout, reset, decode.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("401 Unauthorized: server requires a password")]
    Unauthorized,

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Connect failures and timeouts become `Connection`; anything else reqwest
/// reports stays a `Request`.
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Request(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum SpeedTestError {
    /// 429 retried until the backoff budget ran out.
    #[error("{direction}: rate limited (429) after {retries} retries with size {size} bytes")]
    RateLimitExhausted {
        direction: Direction,
        size: u64,
        retries: u32,
    },

    #[error("{direction}: request blocked (403) at size {size} bytes, rate limit exceeded or IP blocked")]
    Blocked { direction: Direction, size: u64 },

    #[error("{direction}: HTTP error {status} at size {size} bytes")]
    Protocol {
        direction: Direction,
        status: u16,
        size: u64,
    },

    #[error("{direction}: transport error at size {size} bytes: {source}")]
    Transport {
        direction: Direction,
        size: u64,
        #[source]
        source: TransportError,
    },

    #[error("401 Unauthorized: server requires a password")]
    Unauthorized,

    #[error("critical calibration measurement failed: {0}")]
    CalibrationFailed(#[source] Box<SpeedTestError>),

    #[error(
        "failed to measure {direction} speed: no qualifying measurements \
         (attempted sizes: {attempted_sizes:?}, failed sizes: {failed_sizes:?})"
    )]
    MeasurementFailure {
        direction: Direction,
        attempted_sizes: Vec<u64>,
        failed_sizes: Vec<u64>,
    },

    #[error("failed to measure latency: no successful latency probes")]
    NoLatencySamples,
}

impl SpeedTestError {
    /// Errors that end the whole run rather than dropping one sample.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::CalibrationFailed(_)
                | Self::MeasurementFailure { .. }
                | Self::NoLatencySamples
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseParseError {
    #[error("expected kind:bytes:count[:bypass], got '{0}'")]
    Format(String),

    #[error("unknown phase kind '{0}'")]
    Kind(String),

    #[error("invalid number '{0}'")]
    Number(String),

    #[error("repeat count must be positive")]
    ZeroCount,

    #[error("unknown phase flag '{0}'")]
    Flag(String),

    #[error("phase list is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SpeedTestError::Unauthorized.is_fatal());
        assert!(SpeedTestError::NoLatencySamples.is_fatal());
        assert!(!SpeedTestError::Blocked {
            direction: Direction::Upload,
            size: 100_000
        }
        .is_fatal());
        assert!(!SpeedTestError::Transport {
            direction: Direction::Download,
            size: 1,
            source: TransportError::Connection("reset".into()),
        }
        .is_fatal());
    }

    #[test]
    fn measurement_failure_names_direction_and_sizes() {
        let err = SpeedTestError::MeasurementFailure {
            direction: Direction::Upload,
            attempted_sizes: vec![100_000, 1_000_000],
            failed_sizes: vec![1_000_000],
        };
        let msg = err.to_string();
        assert!(msg.contains("upload"));
        assert!(msg.contains("[100000, 1000000]"));
        assert!(msg.contains("failed sizes: [1000000]"));
    }

    #[test]
    fn calibration_failure_keeps_cause() {
        let err = SpeedTestError::CalibrationFailed(Box::new(SpeedTestError::Blocked {
            direction: Direction::Download,
            size: 100_000,
        }));
        assert!(err.to_string().contains("403"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
