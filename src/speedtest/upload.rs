use super::download::ESTIMATED_HEADER_FRACTION;
use super::error::SpeedTestError;
use super::ping::MIN_PING_MS;
use super::retry::{self, RetryPolicy};
use super::transport::{ProbeResponse, Transport};
use super::{Direction, ProbeResult};

/// The server answers once the body is in, so TTFB covers the whole transfer.
pub fn upload_sample(response: &ProbeResponse, requested: u64) -> ProbeResult {
    let ttfb_ms = response.ttfb_ms();
    let duration_ms = ttfb_ms.max(1.0);
    let bits = 8.0 * requested as f64 * (1.0 + ESTIMATED_HEADER_FRACTION);

    ProbeResult {
        bytes: requested,
        bps: bits / (duration_ms / 1000.0),
        duration_ms,
        ping_ms: (ttfb_ms - response.server_time_ms()).max(MIN_PING_MS),
    }
}

pub struct UploadTest<'a, T: ?Sized> {
    transport: &'a T,
    policy: &'a RetryPolicy,
}

impl<'a, T: Transport + ?Sized> UploadTest<'a, T> {
    pub fn new(transport: &'a T, policy: &'a RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn run(&self, bytes: u64) -> Result<ProbeResult, SpeedTestError> {
        retry::drive(
            self.policy,
            Direction::Upload,
            bytes,
            |size| self.transport.upload(size),
            upload_sample,
        )
        .await
    }
}
