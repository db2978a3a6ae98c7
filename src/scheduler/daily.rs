//! Daily scheduling: one pending delivery per active subscriber per day.
//!
//! Scheduling only writes records; no generation or send calls happen here,
//! which keeps the daily pass cheap to re-run after a partial failure.

use crate::error::{DripfeedError, Result};
use crate::scheduler::window::resolve_window;
use crate::store::records::{DeliveryRecord, Subscriber};
use crate::store::DeliveryStore;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome counts for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// New delivery records created
    pub created: usize,
    /// Subscribers skipped: already scheduled, inactive, or bad window/timezone
    pub skipped: usize,
    /// Subscribers considered
    pub total: usize,
}

/// Assigns each subscriber a random send instant inside their local window.
pub struct Scheduler {
    store: Arc<DeliveryStore>,
}

impl Scheduler {
    pub fn new(store: Arc<DeliveryStore>) -> Self {
        Self { store }
    }

    /// Schedule deliveries for all given subscribers on `day`.
    ///
    /// Idempotent: subscribers that already have a non-terminal record for
    /// `day` are skipped, so re-invoking after a partial failure never
    /// double-schedules. Per-subscriber timezone or window problems log a
    /// warning and skip that subscriber; only an invalid subscriber set
    /// fails the batch.
    pub fn schedule_day(&self, subscribers: &[Subscriber], day: NaiveDate) -> Result<ScheduleReport> {
        let mut seen = HashSet::new();
        for subscriber in subscribers {
            if !seen.insert(subscriber.id.as_str()) {
                return Err(DripfeedError::Scheduling(format!(
                    "duplicate subscriber id: {}",
                    subscriber.id
                )));
            }
        }

        let mut report = ScheduleReport {
            total: subscribers.len(),
            ..Default::default()
        };

        for subscriber in subscribers {
            if !subscriber.active {
                report.skipped += 1;
                continue;
            }

            if self.store.has_open_delivery(&subscriber.id, day)? {
                tracing::debug!(subscriber = %subscriber.id, %day, "already scheduled, skipping");
                report.skipped += 1;
                continue;
            }

            let window = resolve_window(
                &subscriber.timezone,
                subscriber.window_start_hour,
                subscriber.window_end_hour,
                day,
            );
            let (start, end) = match window {
                Ok(window) => window,
                Err(e @ (DripfeedError::UnknownTimezone(_) | DripfeedError::InvalidWindow { .. })) => {
                    tracing::warn!(subscriber = %subscriber.id, error = %e, "cannot resolve window, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let scheduled_at = random_instant(start, end);
            let record = DeliveryRecord::new(&subscriber.id, day, scheduled_at);

            if self.store.insert(&record)? {
                tracing::info!(
                    subscriber = %subscriber.id,
                    %day,
                    scheduled_at = %scheduled_at,
                    "delivery scheduled"
                );
                report.created += 1;
            } else {
                // A concurrent scheduling pass won the race; same idempotent skip
                tracing::debug!(subscriber = %subscriber.id, %day, "lost insert race, skipping");
                report.skipped += 1;
            }
        }

        Ok(report)
    }
}

/// A uniformly-random instant in [start, end), at second granularity.
///
/// A window collapsed to zero width by a DST gap yields `start`.
fn random_instant(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    let span = (end - start).num_seconds();
    if span <= 0 {
        return start;
    }

    let offset = rand::rng().random_range(0..span);
    start + Duration::seconds(offset)
}
