//! The delivery worker: drains due deliveries through generate-then-send.
//!
//! `tick` is a pure pass over the due set; the host supplies the timing
//! trigger (cron, a timer loop, a test). Multiple worker processes may tick
//! concurrently against the same database; the store's claim CAS is the only
//! mutual-exclusion point, so one slow upstream call never blocks other
//! records.

use crate::error::{DripfeedError, Result};
use crate::limiter::{Decision, RateLimiter, resource};
use crate::provider::{MessageGenerator, SmsSender};
use crate::store::records::{DeliveryRecord, DeliveryStatus};
use crate::store::{DeliveryStore, HistoryStore};
use crate::worker::backoff::BackoffPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Worker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Attempts before a delivery is finalized as Failed
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// How many recent fingerprints to hand the generator
    pub history_limit: usize,
    /// Claims older than this are presumed orphaned by a crashed worker
    /// and released back to Pending at the start of a tick
    pub claim_lease: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            history_limit: 10,
            claim_lease: std::time::Duration::from_secs(900),
        }
    }
}

/// Counts from one tick, for logging and CLI output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Due records seen
    pub due: usize,
    pub sent: usize,
    /// Failed attempts that will retry after backoff
    pub retrying: usize,
    /// Attempts exhausted; terminal
    pub failed: usize,
    /// Rate-limited and released without attempt cost
    pub throttled: usize,
    pub cancelled: usize,
    /// Claims lost to a concurrent worker
    pub skipped: usize,
    /// Records whose processing hit a store error; left for the next tick
    pub errors: usize,
}

enum Outcome {
    Sent,
    Retrying,
    Failed,
    Throttled,
    Cancelled,
}

/// Processes due deliveries: claim, generate, send, finalize.
pub struct DeliveryWorker {
    store: Arc<DeliveryStore>,
    history: Arc<HistoryStore>,
    limiter: Arc<dyn RateLimiter>,
    generator: Arc<dyn MessageGenerator>,
    sender: Arc<dyn SmsSender>,
    config: WorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<DeliveryStore>,
        history: Arc<HistoryStore>,
        limiter: Arc<dyn RateLimiter>,
        generator: Arc<dyn MessageGenerator>,
        sender: Arc<dyn SmsSender>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            history,
            limiter,
            generator,
            sender,
            config,
        }
    }

    /// Process everything due right now.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Process everything due at `now`. Exposed for tests and backfills.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        // A worker that died mid-delivery leaves its claim InProgress
        // forever; release anything claimed longer than the lease
        let lease = ChronoDuration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| ChronoDuration::seconds(900));
        let reclaimed = self.store.release_stale(now - lease)?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "released stale in-progress claims");
        }

        let due = self.store.due(now)?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        for record in due {
            if !self.store.claim(&record.id)? {
                // Another worker got there first, or the record was cancelled
                report.skipped += 1;
                continue;
            }

            // One record's store error must not starve the rest of the
            // due set; book it and move on
            match self.process(&record.id, now).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::Retrying) => report.retrying += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Throttled) => report.throttled += 1,
                Ok(Outcome::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    tracing::error!(delivery = %record.id, error = %e, "processing failed, leaving record for a later tick");
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                sent = report.sent,
                retrying = report.retrying,
                failed = report.failed,
                throttled = report.throttled,
                cancelled = report.cancelled,
                skipped = report.skipped,
                errors = report.errors,
                "tick complete"
            );
        }
        Ok(report)
    }

    /// Run one claimed delivery through the generate-then-send sequence.
    async fn process(&self, id: &str, now: DateTime<Utc>) -> Result<Outcome> {
        // Reload: the due-scan copy may be stale
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| DripfeedError::DeliveryNotFound(id.to_string()))?;

        // An external cancel can land between the claim and this reload;
        // abort before any external call if the claim is no longer ours
        if record.status != DeliveryStatus::InProgress {
            tracing::info!(delivery = id, status = %record.status, "claim superseded after reload, aborting");
            return Ok(Outcome::Cancelled);
        }

        // Cancellation check before any external call
        let subscriber = self.store.get_subscriber(&record.subscriber_id)?;
        let subscriber = match subscriber {
            Some(s) if s.active => s,
            _ => {
                tracing::info!(delivery = id, subscriber = %record.subscriber_id, "subscriber gone or inactive, cancelling");
                self.store.mark_cancelled(id)?;
                return Ok(Outcome::Cancelled);
            }
        };

        // Generate content unless an earlier attempt already did; a resend
        // reuses the stored content and costs no generation token
        let content = match &record.content {
            Some(content) => content.clone(),
            None => {
                match self.limiter.try_acquire(resource::GENERATION, 1)? {
                    Decision::Allowed => {}
                    Decision::Denied { retry_after } => {
                        self.release_throttled(id, now, retry_after)?;
                        return Ok(Outcome::Throttled);
                    }
                }

                let recent = self
                    .history
                    .recent(&record.subscriber_id, self.config.history_limit)?;

                match self.generator.generate(&subscriber, &recent).await {
                    Ok(message) => {
                        match self.store.set_content(id, &message.content, &message.fingerprint) {
                            Ok(()) => message.content,
                            Err(DripfeedError::InvalidState(_)) => {
                                // Cancelled while the generator was running
                                tracing::info!(delivery = id, "cancelled during generation, aborting");
                                return Ok(Outcome::Cancelled);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return self.handle_attempt_failure(&record, now, &e),
                }
            }
        };

        match self.limiter.try_acquire(resource::SMS, 1)? {
            Decision::Allowed => {}
            Decision::Denied { retry_after } => {
                self.release_throttled(id, now, retry_after)?;
                return Ok(Outcome::Throttled);
            }
        }

        // Last status check before the irrevocable gateway call
        match self.store.get(id)?.map(|r| r.status) {
            Some(DeliveryStatus::InProgress) => {}
            status => {
                tracing::info!(delivery = id, ?status, "cancelled before send, aborting");
                return Ok(Outcome::Cancelled);
            }
        }

        match self.sender.send(&subscriber.phone, &content).await {
            Ok(receipt_id) => {
                if let Err(e) = self.store.mark_sent(id, &receipt_id, now) {
                    if matches!(e, DripfeedError::InvalidState(_)) {
                        // A cancel raced the gateway call; the message went
                        // out but the record was finalized under us
                        tracing::warn!(delivery = id, receipt = %receipt_id, "delivery finalized elsewhere during send");
                        return Ok(Outcome::Cancelled);
                    }
                    return Err(e);
                }
                if let Some(fp) = self
                    .store
                    .get(id)?
                    .and_then(|r| r.content_fingerprint)
                {
                    self.history.record(&record.subscriber_id, &fp, now)?;
                }
                tracing::info!(delivery = id, subscriber = %record.subscriber_id, receipt = %receipt_id, "delivery sent");
                Ok(Outcome::Sent)
            }
            Err(e) => self.handle_attempt_failure(&record, now, &e),
        }
    }

    fn release_throttled(
        &self,
        id: &str,
        now: DateTime<Utc>,
        retry_after: std::time::Duration,
    ) -> Result<()> {
        let next = now
            + ChronoDuration::from_std(retry_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600));
        tracing::debug!(delivery = id, next_attempt = %next, "throttled, releasing claim");
        self.store.release_throttled(id, next)
    }

    /// Book a failed attempt: retry behind backoff, or finalize as Failed
    /// once the attempt ceiling is reached.
    fn handle_attempt_failure(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
        error: &DripfeedError,
    ) -> Result<Outcome> {
        let attempts = record.attempt_count + 1;

        if attempts >= self.config.max_attempts {
            self.store.record_failure(&record.id, &error.to_string(), None)?;
            tracing::error!(
                delivery = %record.id,
                subscriber = %record.subscriber_id,
                attempts,
                error = %error,
                "delivery failed permanently"
            );
            Ok(Outcome::Failed)
        } else {
            let delay = self.config.backoff.delay(attempts);
            let retry_at = now
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(3600));
            self.store
                .record_failure(&record.id, &error.to_string(), Some(retry_at))?;
            tracing::warn!(
                delivery = %record.id,
                subscriber = %record.subscriber_id,
                attempts,
                retry_at = %retry_at,
                error = %error,
                "delivery attempt failed, will retry"
            );
            Ok(Outcome::Retrying)
        }
    }
}
