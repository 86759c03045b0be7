use super::error::{SpeedTestError, TransportError};
use super::transport::{ProbeResponse, Transport};
use tracing::debug;

pub const MIN_PING_MS: f64 = 0.01;

/// TTFB minus the server's own processing time.
pub fn latency_sample(response: &ProbeResponse) -> f64 {
    (response.ttfb_ms() - response.server_time_ms()).max(MIN_PING_MS)
}

pub struct PingTest<'a, T: ?Sized> {
    transport: &'a T,
}

impl<'a, T: Transport + ?Sized> PingTest<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// One round trip. `Ok(None)` means the probe was dropped; only an
    /// authentication failure is worth aborting for.
    pub async fn run(&self) -> Result<Option<f64>, SpeedTestError> {
        match self.transport.latency().await {
            Ok(response) if response.status == 401 => Err(SpeedTestError::Unauthorized),
            Ok(response) if response.is_success() => Ok(Some(latency_sample(&response))),
            Ok(response) => {
                debug!(status = response.status, "Latency probe rejected");
                Ok(None)
            }
            Err(TransportError::Unauthorized) => Err(SpeedTestError::Unauthorized),
            Err(err) => {
                debug!(error = %err, "Latency probe failed");
                Ok(None)
            }
        }
    }
}
