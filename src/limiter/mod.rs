//! Token-bucket rate limiting for outbound API calls.
//!
//! Two backends share one contract: `LocalRateLimiter` keeps buckets in
//! process memory, `SharedRateLimiter` keeps them in SQLite so concurrent
//! worker processes draw from a single budget. Callers never talk to the
//! external APIs without a token from here.

pub mod bucket;
pub mod local;
pub mod shared;

pub use bucket::{BucketParams, TokenBucket};
pub use local::LocalRateLimiter;
pub use shared::SharedRateLimiter;

use crate::error::Result;
use std::time::Duration;

/// Well-known resource names for the two external APIs.
pub mod resource {
    /// Message-generation API quota
    pub const GENERATION: &str = "generation";
    /// SMS gateway quota
    pub const SMS: &str = "sms";
}

/// Outcome of a `try_acquire` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Cost debited; the caller may proceed
    Allowed,
    /// Not enough tokens; `retry_after` estimates when enough will accrue
    Denied { retry_after: Duration },
}

impl Decision {
    /// Check whether the acquisition succeeded.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Shared contract for both limiter backends.
///
/// `try_acquire` refills the named bucket from elapsed time, then debits
/// `cost` tokens or denies with a retry estimate. Never blocks.
pub trait RateLimiter: Send + Sync {
    fn try_acquire(&self, resource: &str, cost: u32) -> Result<Decision>;
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
