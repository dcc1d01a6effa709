//! Exponential backoff with jitter for retryable issuance failures.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy.
///
/// The delay for attempt `n` (zero based) is `base * 2^n`, capped at `cap`, then scaled by a
/// random factor in `1 ± jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.2,
        }
    }

    /// Overrides the jitter fraction (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far beyond any sensible cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);

        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Delay before the given attempt, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub(crate) fn delay_with(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let nominal = self.nominal_delay(attempt);

        if self.jitter == 0.0 {
            return nominal;
        }

        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng as _};

    use super::*;

    #[test]
    fn test_doubling_until_cap() {
        let backoff = Backoff::default().with_jitter(0.0);

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(11), Duration::from_secs(2048));
        assert_eq!(backoff.delay(12), Duration::from_secs(3600));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..20 {
            let nominal = backoff.nominal_delay(attempt).as_secs_f64();
            let delay = backoff.delay_with(attempt, &mut rng).as_secs_f64();

            assert!(delay >= nominal * 0.8 - 1e-9, "{delay} < 0.8 * {nominal}");
            assert!(delay <= nominal * 1.2 + 1e-9, "{delay} > 1.2 * {nominal}");
        }
    }

    #[test]
    fn test_cap_not_below_base() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(backoff.delay(3), Duration::from_secs(10));
    }
}
