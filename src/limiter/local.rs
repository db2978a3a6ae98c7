//! In-process rate limiter backend.

use super::bucket::{BucketParams, TokenBucket};
use super::{Decision, RateLimiter, now_ms};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local token buckets behind a mutex.
///
/// Correct only for single-process deployments: with N independent worker
/// processes each holding its own `LocalRateLimiter`, the true aggregate
/// call rate can reach N times the configured limit. Multi-process
/// deployments must use `SharedRateLimiter`.
pub struct LocalRateLimiter {
    params: HashMap<String, BucketParams>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl LocalRateLimiter {
    /// Create a limiter with the given per-resource limits.
    ///
    /// Resources without configured params are unlimited: the limiter guards
    /// the known external APIs, and failing closed on an unknown name would
    /// silently halt delivery.
    pub fn new(params: HashMap<String, BucketParams>) -> Self {
        Self {
            params,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// `try_acquire` with an explicit clock, for tests.
    pub fn try_acquire_at(&self, resource: &str, cost: u32, now_ms: i64) -> Decision {
        let Some(params) = self.params.get(resource) else {
            return Decision::Allowed;
        };

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(resource.to_string())
            .or_insert_with(|| TokenBucket::full(params, now_ms));

        let decision = bucket.try_debit(params, cost as f64, now_ms);
        if let Decision::Denied { retry_after } = decision {
            tracing::debug!(
                resource,
                cost,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit denied"
            );
        }
        decision
    }
}

impl RateLimiter for LocalRateLimiter {
    fn try_acquire(&self, resource: &str, cost: u32) -> Result<Decision> {
        Ok(self.try_acquire_at(resource, cost, now_ms()))
    }
}
