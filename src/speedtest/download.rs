use super::error::SpeedTestError;
use super::ping::MIN_PING_MS;
use super::retry::{self, RetryPolicy};
use super::transport::{ProbeResponse, Transport};
use super::{Direction, ProbeResult};

/// Share of the wire taken by packet headers on top of the payload.
pub const ESTIMATED_HEADER_FRACTION: f64 = 0.005;

/// Duration is the estimated one-way setup (ping) plus payload transfer time.
pub fn download_sample(response: &ProbeResponse, requested: u64) -> ProbeResult {
    let ping_ms = (response.ttfb_ms() - response.server_time_ms()).max(MIN_PING_MS);
    let payload_ms = response.payload_ms().max(1.0);
    let duration_ms = ping_ms + payload_ms;

    let estimated = requested as f64 * (1.0 + ESTIMATED_HEADER_FRACTION);
    let bits = 8.0 * (response.bytes_transferred as f64).max(estimated);

    ProbeResult {
        bytes: requested,
        bps: bits / (duration_ms / 1000.0),
        duration_ms,
        ping_ms,
    }
}

pub struct DownloadTest<'a, T: ?Sized> {
    transport: &'a T,
    policy: &'a RetryPolicy,
}

impl<'a, T: Transport + ?Sized> DownloadTest<'a, T> {
    pub fn new(transport: &'a T, policy: &'a RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn run(&self, bytes: u64) -> Result<ProbeResult, SpeedTestError> {
        retry::drive(
            self.policy,
            Direction::Download,
            bytes,
            |size| self.transport.download(size),
            download_sample,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bandwidth_uses_ping_plus_payload() {
        let response = ProbeResponse {
            status: 200,
            ttfb: Duration::from_millis(30),
            payload: Duration::from_millis(780),
            bytes_transferred: 1_000_000,
            ..Default::default()
        };
        let result = download_sample(&response, 1_000_000);

        assert!((result.ping_ms - 20.0).abs() < 1e-9);
        assert!((result.duration_ms - 800.0).abs() < 1e-9);
        // 8 * 1_005_000 bits over 0.8 s
        assert!((result.bps - 10_050_000.0).abs() < 1e-3);
        assert_eq!(result.bytes, 1_000_000);
    }

    #[test]
    fn transferred_bytes_win_when_larger() {
        let response = ProbeResponse {
            status: 200,
            server_timing: Some("dur=0".into()),
            ttfb: Duration::from_millis(0),
            payload: Duration::from_millis(1000),
            bytes_transferred: 2_000_000,
            ..Default::default()
        };
        let result = download_sample(&response, 1_000_000);
        let expected = 16_000_000.0 / (result.duration_ms / 1000.0);
        assert!((result.bps - expected).abs() < 1e-6);
        assert!(result.bps > 15_999_000.0);
    }

    #[test]
    fn payload_time_has_one_millisecond_floor() {
        let response = ProbeResponse {
            status: 200,
            ttfb: Duration::from_millis(10),
            payload: Duration::ZERO,
            ..Default::default()
        };
        let result = download_sample(&response, 100_000);
        assert!((result.duration_ms - (MIN_PING_MS + 1.0)).abs() < 1e-9);
        assert!(result.duration_ms >= 1.0);
    }
}
