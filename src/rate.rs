use std::time::{Duration, Instant};

/// Sliding window used by every rate estimator (pull-level and per-layer).
const WINDOW: Duration = Duration::from_secs(10);

struct Sample {
    at: Instant,
    bytes: i64,
}

/// Sliding-window throughput/ETA estimator over a cumulative byte counter.
///
/// One instance lives per pull and per layer (see `Aggregator`). Callers must
/// feed monotonically non-decreasing cumulative values — clamping a restarted
/// pull's counter is the caller's job (§4.4), not this type's.
pub struct RateEstimator {
    samples: Vec<Sample>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Append a new cumulative-bytes observation and prune samples older than
    /// the window, retaining exactly one anchor sample from before the cutoff
    /// so the rate over a partial window stays computable.
    pub fn add(&mut self, bytes: i64) {
        let now = Instant::now();
        self.samples.push(Sample { at: now, bytes });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(WINDOW).unwrap_or(now);
        let keep_from = self
            .samples
            .iter()
            .rposition(|s| s.at < cutoff)
            .unwrap_or(0);
        if keep_from > 0 {
            self.samples.drain(0..keep_from);
        }
    }

    /// Bytes/second over the retained window, clamped to 0 when the computed
    /// rate would be negative or the time span is zero.
    pub fn rate(&self) -> f64 {
        let (first, last) = match (self.samples.first(), self.samples.last()) {
            (Some(f), Some(l)) if self.samples.len() >= 2 => (f, l),
            _ => return 0.0,
        };

        let dt = last.at.saturating_duration_since(first.at).as_secs_f64();
        if dt <= 0.0 {
            return 0.0;
        }

        let db = (last.bytes - first.bytes) as f64;
        (db / dt).max(0.0)
    }

    /// Seconds remaining to transfer `remaining` bytes at the current rate,
    /// or 0 when the rate is not yet positive.
    pub fn eta(&self, remaining: i64) -> f64 {
        let rate = self.rate();
        if rate <= 0.0 {
            0.0
        } else {
            remaining as f64 / rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn no_samples_rate_is_zero() {
        let est = RateEstimator::new();
        assert_eq!(est.rate(), 0.0);
    }

    #[test]
    fn single_sample_rate_is_zero() {
        let mut est = RateEstimator::new();
        est.add(1000);
        assert_eq!(est.rate(), 0.0);
    }

    #[test]
    fn two_increasing_samples_give_positive_rate() {
        let mut est = RateEstimator::new();
        est.add(0);
        sleep(Duration::from_millis(20));
        est.add(1000);
        assert!(est.rate() > 0.0);
    }

    #[test]
    fn restart_drop_clamps_to_zero_not_negative() {
        let mut est = RateEstimator::new();
        est.add(1000);
        sleep(Duration::from_millis(10));
        est.add(500);
        assert_eq!(est.rate(), 0.0);
    }

    #[test]
    fn eta_is_zero_when_rate_not_positive() {
        let est = RateEstimator::new();
        assert_eq!(est.eta(1000), 0.0);
    }

    #[test]
    fn eta_divides_remaining_by_rate() {
        let mut est = RateEstimator::new();
        est.add(0);
        sleep(Duration::from_millis(50));
        est.add(500);
        let rate = est.rate();
        assert!(rate > 0.0);
        let eta = est.eta(500);
        assert!((eta - 500.0 / rate).abs() < 1e-9);
    }
}
