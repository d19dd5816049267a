//! Retry delays for failed refresh cycles.
//!
//! The delay is a pure function of the attempt number and a jitter sample, so
//! it can be tested without timers. The scheduler draws the sample from `rand`.

use std::time::Duration;

/// Exponential backoff with a cap and proportional jitter.
///
/// Attempt `n` (1-based) waits `base * 2^(n-1)`, capped at `max`, then
/// shortened by up to `jitter` of itself. There is no attempt limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Fraction in `[0, 1]` of the delay that may be randomly shaved off.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Same delays without randomness.
    pub fn without_jitter(self) -> Self {
        Self { jitter: 0.0, ..self }
    }

    /// Delay before a retry, without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exp;
        let nanos = self.base.as_nanos().saturating_mul(u128::from(factor));
        let max = self.max.as_nanos();
        let capped = nanos.min(max);
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay before retry number `attempt`, given a uniform sample in `[0, 1)`.
    ///
    /// The result lies in `[(1 - jitter) * ceiling, ceiling]`.
    pub fn delay(&self, attempt: u32, sample: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        ceiling.mul_f64(1.0 - jitter * sample)
    }

    /// Delay with a fresh random sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay(attempt, rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let b = backoff().without_jitter();
        let secs: Vec<u64> = (1..=8).map(|n| b.delay(n, 0.9).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        assert_eq!(backoff().ceiling(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempts_stay_at_max() {
        assert_eq!(backoff().ceiling(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_shortens_proportionally() {
        let b = backoff();
        assert_eq!(b.delay(3, 0.0), Duration::from_secs(4));
        assert_eq!(b.delay(3, 1.0), Duration::from_secs(2));
        assert_eq!(b.delay(3, f64::NAN), Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn delay_within_bounds(attempt in 0u32..200, sample in 0.0f64..1.0) {
            let b = backoff();
            let d = b.delay(attempt, sample);
            let ceiling = b.ceiling(attempt);
            prop_assert!(d <= ceiling);
            prop_assert!(d >= ceiling.mul_f64(0.5));
            prop_assert!(d <= b.max);
        }
    }
}
