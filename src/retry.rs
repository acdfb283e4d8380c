use std::time::Duration;

use rand::Rng;

const DEFAULT_MAX_RETRIES: u32 = 8;
const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_JITTER: f64 = 0.5;

/// Retry policy shared by all groups unless overridden: maximum retry
/// count, first backoff duration and jitter factor. Immutable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryBackoff {
    max_retries: u32,
    first_backoff: Duration,
    jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            max_retries: DEFAULT_MAX_RETRIES,
            first_backoff: DEFAULT_FIRST_BACKOFF,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryBackoff {
    /// Create a policy. The jitter factor is clamped into `[0, 1]`.
    pub fn new(max_retries: u32, first_backoff: Duration, jitter: f64) -> Self {
        RetryBackoff {
            max_retries,
            first_backoff,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Pre-jitter delay for a delivery carrying `retry_count`.
    ///
    /// The first attempt (count 0) is not delayed; the n-th retry waits
    /// `first_backoff * 2^(n-1)`, so delays strictly double per retry.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let shift = (retry_count - 1).min(31);
        self.first_backoff.saturating_mul(1u32 << shift)
    }

    /// Delay to schedule before invoking the listener, randomized within
    /// `[base * (1 - jitter), base * (1 + jitter)]` to avoid synchronized
    /// retry storms.
    pub fn delay_before(&self, retry_count: u32) -> Duration {
        let base = self.base_delay(retry_count);
        if base.is_zero() || self.jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        let policy = RetryBackoff::default();
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
    }

    #[test]
    fn delays_strictly_double() {
        let policy = RetryBackoff::new(5, Duration::from_millis(100), 0.0);
        let delays: Vec<_> = (1..=5).map(|n| policy.base_delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
        for pair in delays.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryBackoff::new(3, Duration::from_millis(50), 0.0);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryBackoff::new(3, Duration::from_millis(100), 0.5);
        for _ in 0..100 {
            let delay = policy.delay_before(1);
            assert!(delay >= Duration::from_millis(50), "delay {:?}", delay);
            assert!(delay <= Duration::from_millis(150), "delay {:?}", delay);
        }
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let policy = RetryBackoff::new(3, Duration::from_millis(10), 7.5);
        assert_eq!(policy.jitter(), 1.0);
    }

    #[test]
    fn huge_retry_count_saturates() {
        let policy = RetryBackoff::new(u32::MAX, Duration::from_secs(1), 0.0);
        // Must not overflow or panic.
        let _ = policy.base_delay(u32::MAX);
    }
}
