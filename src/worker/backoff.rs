//! Retry backoff policy.
//!
//! Delay doubles per attempt from a base, capped at a maximum, with up to
//! 20% random jitter so many subscribers failing at once do not retry in
//! lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Ceiling for the exponential term
    pub max: Duration,
    /// Upper bound of the random jitter fraction (0.2 = up to +20%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(3600),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the number of attempts so far.
    ///
    /// `attempt` is 1-based: after the first failure pass 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exp)).min(self.max);

        let jitter = if self.jitter > 0.0 {
            rand::rng().random_range(0.0..=self.jitter)
        } else {
            0.0
        };
        raw.mul_f64(1.0 + jitter)
    }
}
