//! Adaptive-size retry controller for a single bandwidth probe.
//!
//! One probe attempt walks `Attempting -> {Success, Retrying, Failed}`. A 429
//! first halves the payload down to a floor, then falls back to exponential
//! backoff driven by `Retry-After`. Everything else fails the attempt at once,
//! including transport-level errors, which are never retried.

use super::error::{SpeedTestError, TransportError};
use super::transport::ProbeResponse;
use super::{Direction, ProbeResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Backoff retries allowed once the payload is at the floor.
    pub max_retries: u32,
    /// Smallest payload adaptive sizing will request.
    pub min_bytes: u64,
    /// Pause after a 429 that shrank the payload.
    pub shrink_delay: Duration,
    /// Backoff base when the server sends no usable `Retry-After`.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_bytes: 100_000,
            shrink_delay: Duration::from_millis(100),
            default_retry_after: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    pub current_size: u64,
    pub retry_count: u32,
    pub shrinks: u32,
    pub last_retry_after: Option<Duration>,
}

impl RetryState {
    pub fn new(size: u64) -> Self {
        Self {
            current_size: size,
            retry_count: 0,
            shrinks: 0,
            last_retry_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    Shrink { from: u64, to: u64 },
    Backoff { attempt: u32 },
}

#[derive(Debug)]
pub enum Attempt {
    Success(ProbeResult),
    Retry {
        state: RetryState,
        delay: Duration,
        kind: RetryKind,
    },
    Failed(SpeedTestError),
}

impl RetryPolicy {
    /// `retry_after * 2^retry_count`.
    pub fn backoff_delay(&self, retry_after: Duration, retry_count: u32) -> Duration {
        retry_after.saturating_mul(2u32.saturating_pow(retry_count))
    }

    pub fn shrunk_size(&self, size: u64) -> u64 {
        (size / 2).max(self.min_bytes)
    }

    /// Decides what one response means for the attempt. Pure; sleeping is
    /// left to the caller.
    pub fn step<S>(
        &self,
        direction: Direction,
        state: RetryState,
        outcome: Result<ProbeResponse, TransportError>,
        sample: S,
    ) -> Attempt
    where
        S: FnOnce(&ProbeResponse, u64) -> ProbeResult,
    {
        let size = state.current_size;
        let response = match outcome {
            Ok(response) => response,
            Err(TransportError::Unauthorized) => return Attempt::Failed(SpeedTestError::Unauthorized),
            Err(source) => {
                return Attempt::Failed(SpeedTestError::Transport {
                    direction,
                    size,
                    source,
                })
            }
        };

        match response.status {
            401 => Attempt::Failed(SpeedTestError::Unauthorized),
            403 => Attempt::Failed(SpeedTestError::Blocked { direction, size }),
            429 if size > self.min_bytes => {
                let next = self.shrunk_size(size);
                Attempt::Retry {
                    state: RetryState {
                        current_size: next,
                        shrinks: state.shrinks + 1,
                        last_retry_after: response.retry_after(),
                        ..state
                    },
                    delay: self.shrink_delay,
                    kind: RetryKind::Shrink { from: size, to: next },
                }
            }
            429 if state.retry_count < self.max_retries => {
                let hint = response.retry_after();
                let delay = self.backoff_delay(
                    hint.unwrap_or(self.default_retry_after),
                    state.retry_count,
                );
                Attempt::Retry {
                    state: RetryState {
                        retry_count: state.retry_count + 1,
                        last_retry_after: hint,
                        ..state
                    },
                    delay,
                    kind: RetryKind::Backoff {
                        attempt: state.retry_count + 1,
                    },
                }
            }
            429 => Attempt::Failed(SpeedTestError::RateLimitExhausted {
                direction,
                size,
                retries: state.retry_count,
            }),
            status if !response.is_success() => Attempt::Failed(SpeedTestError::Protocol {
                direction,
                status,
                size,
            }),
            _ => Attempt::Success(sample(&response, size)),
        }
    }
}

/// Runs one probe attempt to completion, sleeping between retries.
pub async fn drive<F, Fut, S>(
    policy: &RetryPolicy,
    direction: Direction,
    bytes: u64,
    mut request: F,
    sample: S,
) -> Result<ProbeResult, SpeedTestError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<ProbeResponse, TransportError>>,
    S: Fn(&ProbeResponse, u64) -> ProbeResult,
{
    let mut state = RetryState::new(bytes);

    loop {
        debug!(
            %direction,
            size = state.current_size,
            retry = state.retry_count,
            "Starting probe attempt"
        );
        let outcome = request(state.current_size).await;

        match policy.step(direction, state, outcome, &sample) {
            Attempt::Success(result) => return Ok(result),
            Attempt::Retry { state: next, delay, kind } => {
                match kind {
                    RetryKind::Shrink { from, to } => warn!(
                        %direction,
                        from,
                        to,
                        "429 from server, reducing bytes per request"
                    ),
                    RetryKind::Backoff { attempt } => warn!(
                        %direction,
                        attempt,
                        max_retries = policy.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "Rate limited (429), backing off"
                    ),
                }
                sleep(delay).await;
                state = next;
            }
            Attempt::Failed(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::ready;

    fn status(status: u16) -> ProbeResponse {
        ProbeResponse {
            status,
            ..Default::default()
        }
    }

    fn limited(retry_after: Option<&str>) -> ProbeResponse {
        ProbeResponse {
            status: 429,
            retry_after: retry_after.map(str::to_string),
            ..Default::default()
        }
    }

    fn fake_sample(_: &ProbeResponse, bytes: u64) -> ProbeResult {
        ProbeResult {
            bytes,
            bps: 1.0,
            duration_ms: 100.0,
            ping_ms: 1.0,
        }
    }

    fn step(state: RetryState, outcome: Result<ProbeResponse, TransportError>) -> Attempt {
        RetryPolicy::default().step(Direction::Download, state, outcome, fake_sample)
    }

    #[test]
    fn transport_error_drops_without_retry() {
        let attempt = step(
            RetryState::new(1_000_000),
            Err(TransportError::Connection("reset by peer".into())),
        );
        assert!(matches!(
            attempt,
            Attempt::Failed(SpeedTestError::Transport { size: 1_000_000, .. })
        ));
    }

    #[test]
    fn forbidden_fails_immediately() {
        let attempt = step(RetryState::new(1_000_000), Ok(status(403)));
        assert!(matches!(
            attempt,
            Attempt::Failed(SpeedTestError::Blocked { size: 1_000_000, .. })
        ));
    }

    #[test]
    fn unauthorized_fails_immediately() {
        assert!(matches!(
            step(RetryState::new(100_000), Ok(status(401))),
            Attempt::Failed(SpeedTestError::Unauthorized)
        ));
        assert!(matches!(
            step(RetryState::new(100_000), Err(TransportError::Unauthorized)),
            Attempt::Failed(SpeedTestError::Unauthorized)
        ));
    }

    #[test]
    fn other_errors_are_protocol_failures() {
        let attempt = step(RetryState::new(100_000), Ok(status(503)));
        assert!(matches!(
            attempt,
            Attempt::Failed(SpeedTestError::Protocol { status: 503, .. })
        ));
    }

    #[test]
    fn rate_limit_above_floor_shrinks() {
        match step(RetryState::new(1_000_000), Ok(limited(Some("5")))) {
            Attempt::Retry { state, delay, kind } => {
                assert_eq!(state.current_size, 500_000);
                assert_eq!(state.retry_count, 0);
                assert_eq!(state.shrinks, 1);
                assert_eq!(state.last_retry_after, Some(Duration::from_secs(5)));
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(
                    kind,
                    RetryKind::Shrink {
                        from: 1_000_000,
                        to: 500_000
                    }
                );
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn shrink_clamps_to_floor() {
        match step(RetryState::new(125_000), Ok(limited(None))) {
            Attempt::Retry { state, .. } => assert_eq!(state.current_size, 100_000),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_at_floor_backs_off_exponentially() {
        let mut state = RetryState::new(100_000);
        state.retry_count = 2;
        match step(state, Ok(limited(Some("1")))) {
            Attempt::Retry { state, delay, kind } => {
                assert_eq!(state.current_size, 100_000);
                assert_eq!(state.retry_count, 3);
                assert_eq!(delay, Duration::from_secs(4));
                assert_eq!(kind, RetryKind::Backoff { attempt: 3 });
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn missing_retry_after_uses_default() {
        match step(RetryState::new(100_000), Ok(limited(Some("soon")))) {
            Attempt::Retry { delay, state, .. } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(state.last_retry_after, None);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn oversized_retry_after_is_capped() {
        match step(RetryState::new(100_000), Ok(limited(Some("1e30")))) {
            Attempt::Retry { delay, state, .. } => {
                assert_eq!(delay, Duration::from_secs(3600));
                assert_eq!(state.retry_count, 1);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_at_ceiling_is_exhausted() {
        let mut state = RetryState::new(100_000);
        state.retry_count = 3;
        assert!(matches!(
            step(state, Ok(limited(None))),
            Attempt::Failed(SpeedTestError::RateLimitExhausted {
                size: 100_000,
                retries: 3,
                ..
            })
        ));
    }

    #[test]
    fn success_samples_adapted_size() {
        let mut state = RetryState::new(1_000_000);
        state.current_size = 250_000;
        match step(state, Ok(status(200))) {
            Attempt::Success(result) => assert_eq!(result.bytes, 250_000),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_shrinks_then_backs_off_then_fails() {
        let policy = RetryPolicy::default();
        let mut sizes = Vec::new();
        let started = tokio::time::Instant::now();

        let result = drive(
            &policy,
            Direction::Download,
            1_000_000,
            |size| {
                sizes.push(size);
                ready(Ok(limited(None)))
            },
            fake_sample,
        )
        .await;

        assert_eq!(
            sizes,
            vec![1_000_000, 500_000, 250_000, 125_000, 100_000, 100_000, 100_000, 100_000]
        );
        assert!(matches!(
            result,
            Err(SpeedTestError::RateLimitExhausted {
                size: 100_000,
                retries: 3,
                ..
            })
        ));
        // Four shrink pauses plus 2s + 4s + 8s of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(14_400));
        assert!(elapsed < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_one_shrink() {
        let policy = RetryPolicy::default();
        let mut calls = 0;

        let result = drive(
            &policy,
            Direction::Upload,
            1_000_000,
            |_| {
                calls += 1;
                let response = if calls == 1 { limited(None) } else { status(200) };
                ready(Ok(response))
            },
            fake_sample,
        )
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(result.bytes, 500_000);
    }

    #[test]
    fn backoff_delay_doubles() {
        let policy = RetryPolicy::default();
        let base = Duration::from_secs(2);
        assert_eq!(policy.backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(base, 2), Duration::from_secs(8));
    }
}
