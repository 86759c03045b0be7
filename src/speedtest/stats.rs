//! Reductions over collected samples.

use super::{ProbeResult, BANDWIDTH_MIN_REQUEST_DURATION_MS};

/// Linear-interpolation percentile.
///
/// `perc` may be given as a fraction (`0.9`) or on the 0-100 scale (`90`);
/// anything above 1 is divided by 100. Empty input yields 0.
pub fn percentile(values: &[f64], perc: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let perc = normalize_percentile(perc);
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (sorted.len() - 1) as f64 * perc;
    let floor = rank.floor() as usize;
    let rem = rank - rank.floor();
    if rem == 0.0 {
        return sorted[floor];
    }

    let lo = sorted[floor];
    let hi = sorted[(floor + 1).min(sorted.len() - 1)];
    lo + (hi - lo) * rem
}

pub fn normalize_percentile(perc: f64) -> f64 {
    let perc = if perc > 1.0 { perc / 100.0 } else { perc };
    perc.clamp(0.0, 1.0)
}

/// Mean absolute difference between consecutive samples, in measurement order.
pub fn jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (samples.len() - 1) as f64
}

/// The most recent `window` samples when enough were collected, else all of them.
pub fn latency_window(samples: &[f64], window: usize) -> &[f64] {
    if samples.len() >= window {
        &samples[samples.len() - window..]
    } else {
        samples
    }
}

/// Bits per second of every result long enough to be trusted.
pub fn qualifying_bps<'a, I>(results: I) -> Vec<f64>
where
    I: IntoIterator<Item = &'a ProbeResult>,
{
    results
        .into_iter()
        .filter(|r| r.duration_ms >= BANDWIDTH_MIN_REQUEST_DURATION_MS)
        .map(|r| r.bps)
        .collect()
}
