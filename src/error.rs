//! Error types for dripfeed
//!
//! Centralized error handling using thiserror.

use std::time::Duration;
use thiserror::Error;

/// All error types that can occur in dripfeed
#[derive(Debug, Error)]
pub enum DripfeedError {
    /// Invalid input to the scheduler, fatal to that scheduling call
    #[error("Scheduling failed: {0}")]
    Scheduling(String),

    /// Rate limiter denial; always retryable without attempt-count cost
    #[error("Throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Message generation failure (transient, retryable)
    #[error("Generation failed: {0}")]
    Generation(String),

    /// SMS gateway failure (transient, retryable)
    #[error("Send failed: {0}")]
    Send(String),

    /// Timezone name not recognized; skips that subscriber only
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// Delivery window start hour is not before its end hour
    #[error("Invalid delivery window: start hour {start} >= end hour {end}")]
    InvalidWindow { start: u8, end: u8 },

    /// Delivery record not found in storage
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for DripfeedError {
    fn from(err: rusqlite::Error) -> Self {
        DripfeedError::Storage(err.to_string())
    }
}

/// Result type alias for dripfeed operations
pub type Result<T> = std::result::Result<T, DripfeedError>;
