use crate::speedtest::retry::RetryPolicy;
use crate::speedtest::{default_phases, stats, MeasurementPhase};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://speed.cloudflare.com";

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub password: Option<String>,
    pub phases: Vec<MeasurementPhase>,
    /// Bandwidth percentile on the 0-100 scale.
    pub percentile: f64,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pause between probes of one phase.
    pub request_delay: Duration,
    /// Pause before a phase whose payload size differs from the previous one.
    pub phase_delay: Duration,
    /// Advisory only; logged at start, never enforced.
    pub patience: Duration,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            password: None,
            phases: default_phases(),
            percentile: 90.0,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_delay: Duration::from_millis(100),
            phase_delay: Duration::from_millis(500),
            patience: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Percentile as a fraction in [0, 1].
    pub fn bandwidth_percentile(&self) -> f64 {
        stats::normalize_percentile(self.percentile)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout.as_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    Percentile,
    Timeout,
    MaxRetries,
}

impl SettingsField {
    pub fn next(self) -> Self {
        match self {
            SettingsField::Percentile => SettingsField::Timeout,
            SettingsField::Timeout => SettingsField::MaxRetries,
            SettingsField::MaxRetries => SettingsField::Percentile,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SettingsField::Percentile => SettingsField::MaxRetries,
            SettingsField::Timeout => SettingsField::Percentile,
            SettingsField::MaxRetries => SettingsField::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_standard_run() {
        let settings = Settings::default();
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.phases.len(), 14);
        assert_eq!(settings.bandwidth_percentile(), 0.9);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.min_bytes, 100_000);
        assert_eq!(settings.request_timeout_secs(), 60);
    }

    #[test]
    fn fractional_percentile_is_kept() {
        let settings = Settings {
            percentile: 0.5,
            ..Settings::default()
        };
        assert_eq!(settings.bandwidth_percentile(), 0.5);
    }

    #[test]
    fn fields_cycle() {
        let mut field = SettingsField::Percentile;
        for _ in 0..3 {
            field = field.next();
        }
        assert_eq!(field, SettingsField::Percentile);
        assert_eq!(SettingsField::Percentile.prev(), SettingsField::MaxRetries);
    }
}
