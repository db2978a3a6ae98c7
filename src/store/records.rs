//! Record types for delivery persistence.
//!
//! This module defines the `DeliveryRecord` state machine that tracks one
//! scheduled message per subscriber per day, plus the read-only `Subscriber`
//! view of the external user-management data.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// A message recipient, owned by the external user-management collaborator.
///
/// The pipeline only reads subscribers; it never creates or mutates them
/// (test helpers and seeding aside).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscriber {
    pub id: String,
    pub phone: String,
    /// IANA timezone name, e.g. "America/New_York"
    pub timezone: String,
    /// Local hour-of-day the delivery window opens (inclusive)
    pub window_start_hour: u8,
    /// Local hour-of-day the delivery window closes (exclusive)
    pub window_end_hour: u8,
    pub active: bool,
}

/// The unit of work: one scheduled delivery for one subscriber on one day.
///
/// Created by the scheduler, mutated only by the delivery worker through the
/// store's atomic claim/release/finalize operations, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    /// Timestamp-based ID, unique and stable
    pub id: String,

    pub subscriber_id: String,

    /// Calendar day this delivery was scheduled for
    pub day: NaiveDate,

    /// Target send instant in UTC; immutable once computed for the day
    pub scheduled_at: DateTime<Utc>,

    pub status: DeliveryStatus,

    /// Number of external attempts started; never decremented
    pub attempt_count: u32,

    /// Backoff gate: a retryable Pending record is not due before this
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Generated message body, persisted so retries resend the same content
    pub content: Option<String>,

    /// Stable hash of the content, used for history dedup
    pub content_fingerprint: Option<String>,

    pub sent_at: Option<DateTime<Utc>>,

    /// Gateway receipt id returned on a successful send
    pub receipt_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Create a new pending delivery for the given subscriber and day.
    pub fn new(subscriber_id: &str, day: NaiveDate, scheduled_at: DateTime<Utc>) -> Self {
        // Truncate to millisecond precision so the model matches what the
        // store's schema persists and round-trips compare equal.
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
            .expect("current time fits in millisecond timestamp");
        Self {
            id: generate_delivery_id(),
            subscriber_id: subscriber_id.to_string(),
            day,
            scheduled_at,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            content: None,
            content_fingerprint: None,
            sent_at: None,
            receipt_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this record is due for processing at `now`.
    ///
    /// Pending, past its scheduled instant, and past any backoff gate.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.scheduled_at <= now
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// Delivery status state machine.
///
/// Transitions only move forward:
/// Pending -> InProgress -> {Sent, Cancelled, Failed, back to Pending on a
/// retryable failure or throttle release}. Sent, Failed, and Cancelled are
/// terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its scheduled instant (or for a retry backoff to elapse)
    Pending,
    /// Claimed by a worker; exactly one worker holds this at a time
    InProgress,
    /// Message delivered to the gateway
    Sent,
    /// Max attempts exhausted; surfaced to monitoring, never retried
    Failed,
    /// Subscriber opted out or disappeared before delivery
    Cancelled,
}

impl DeliveryStatus {
    /// Get the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "in_progress" => Some(DeliveryStatus::InProgress),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "cancelled" => Some(DeliveryStatus::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate a unique delivery ID based on timestamp with sub-second precision.
///
/// Format: seconds + microseconds + counter suffix (e.g. "17378028001234560001").
/// Uniqueness holds even when scheduling many records in the same second.
pub fn generate_delivery_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");

    let secs = duration.as_secs();
    let micros = duration.subsec_micros();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{}{:06}{:04}", secs, micros, counter % 10000)
}

/// Compute a stable fingerprint of message content.
///
/// SHA-256 truncated to 16 hex characters; enough to detect repeats in a
/// per-subscriber history window.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
