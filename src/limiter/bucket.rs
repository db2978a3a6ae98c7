//! Pure token-bucket math, shared by both limiter backends.
//!
//! A bucket holds up to `capacity` tokens and refills at `refill_per_sec`.
//! The backends own storage and locking; this type only computes.

use super::Decision;
use std::time::Duration;

/// Ceiling on retry-after estimates, also returned when tokens can never
/// accrue (zero refill rate, or cost above capacity).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

const EPSILON: f64 = 1e-9;

/// Static limits for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Mutable bucket state: current tokens and the last refill instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl TokenBucket {
    /// A bucket starting full at `now_ms`.
    pub fn full(params: &BucketParams, now_ms: i64) -> Self {
        Self {
            tokens: params.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Add tokens for the elapsed time since the last refill, capped at
    /// capacity. Clock going backwards adds nothing.
    pub fn refill(&mut self, params: &BucketParams, now_ms: i64) {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0);
        let accrued = (elapsed_ms as f64 / 1000.0) * params.refill_per_sec;
        self.tokens = (self.tokens + accrued).min(params.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Refill, then debit `cost` tokens or deny with a retry estimate.
    ///
    /// Refill-and-debit happen in one step on this value; atomicity across
    /// callers is the backend's responsibility.
    pub fn try_debit(&mut self, params: &BucketParams, cost: f64, now_ms: i64) -> Decision {
        self.refill(params, now_ms);

        if self.tokens + EPSILON >= cost {
            self.tokens -= cost;
            Decision::Allowed
        } else {
            Decision::Denied {
                retry_after: self.retry_after(params, cost),
            }
        }
    }

    /// Estimate how long until `cost` tokens will be available.
    fn retry_after(&self, params: &BucketParams, cost: f64) -> Duration {
        if params.refill_per_sec <= 0.0 || cost > params.capacity {
            return MAX_RETRY_AFTER;
        }

        let deficit = (cost - self.tokens).max(0.0);
        let secs = deficit / params.refill_per_sec;
        Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(capacity: f64, refill_per_sec: f64) -> BucketParams {
        BucketParams {
            capacity,
            refill_per_sec,
        }
    }

    #[test]
    fn test_full_bucket_allows_capacity_then_denies() {
        // Refill rate 0: exactly C acquisitions succeed, the rest are denied
        let p = params(5.0, 0.0);
        let mut bucket = TokenBucket::full(&p, 0);

        for _ in 0..5 {
            assert_eq!(bucket.try_debit(&p, 1.0, 0), Decision::Allowed);
        }
        for _ in 0..3 {
            assert!(matches!(bucket.try_debit(&p, 1.0, 0), Decision::Denied { .. }));
        }
    }

    #[test]
    fn test_refill_accrues_over_time() {
        let p = params(10.0, 2.0);
        let mut bucket = TokenBucket::full(&p, 0);

        // Drain the bucket
        assert_eq!(bucket.try_debit(&p, 10.0, 0), Decision::Allowed);
        assert!(matches!(bucket.try_debit(&p, 1.0, 0), Decision::Denied { .. }));

        // 1.5 seconds at 2 tokens/sec = 3 tokens
        assert_eq!(bucket.try_debit(&p, 3.0, 1500), Decision::Allowed);
        assert!(matches!(bucket.try_debit(&p, 1.0, 1500), Decision::Denied { .. }));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let p = params(4.0, 100.0);
        let mut bucket = TokenBucket::full(&p, 0);

        // A long idle period does not overfill
        bucket.refill(&p, 60_000);
        assert!((bucket.tokens - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_backwards_adds_nothing() {
        let p = params(5.0, 1.0);
        let mut bucket = TokenBucket::full(&p, 10_000);
        bucket.try_debit(&p, 5.0, 10_000);

        bucket.refill(&p, 5_000);
        assert!(bucket.tokens < 1e-9);
    }

    #[test]
    fn test_retry_after_estimate() {
        let p = params(10.0, 2.0);
        let mut bucket = TokenBucket::full(&p, 0);
        bucket.try_debit(&p, 10.0, 0);

        // Need 4 tokens at 2/sec: about 2 seconds
        match bucket.try_debit(&p, 4.0, 0) {
            Decision::Denied { retry_after } => {
                assert!(retry_after >= Duration::from_secs_f64(1.9));
                assert!(retry_after <= Duration::from_secs_f64(2.1));
            }
            Decision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_zero_refill_rate_uses_max_retry_after() {
        let p = params(1.0, 0.0);
        let mut bucket = TokenBucket::full(&p, 0);
        bucket.try_debit(&p, 1.0, 0);

        match bucket.try_debit(&p, 1.0, 0) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, MAX_RETRY_AFTER),
            Decision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_cost_above_capacity_never_satisfiable() {
        let p = params(2.0, 5.0);
        let mut bucket = TokenBucket::full(&p, 0);

        match bucket.try_debit(&p, 3.0, 0) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, MAX_RETRY_AFTER),
            Decision::Allowed => panic!("expected denial"),
        }
    }
}
