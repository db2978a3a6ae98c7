//! End-to-end pipeline integration tests
//!
//! Exercises schedule -> claim -> generate -> send against a real SQLite
//! file with mock upstream providers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use dripfeed::error::{DripfeedError, Result};
use dripfeed::limiter::{BucketParams, RateLimiter, SharedRateLimiter, resource};
use dripfeed::provider::{GeneratedMessage, MessageGenerator, SmsSender, SubscriberDirectory};
use dripfeed::scheduler::{Scheduler, resolve_window};
use dripfeed::store::records::fingerprint;
use dripfeed::store::{DeliveryStatus, DeliveryStore, HistoryStore, Subscriber};
use dripfeed::worker::{BackoffPolicy, DeliveryWorker, WorkerConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct StubGenerator;

#[async_trait]
impl MessageGenerator for StubGenerator {
    async fn generate(
        &self,
        subscriber: &Subscriber,
        _recent: &[String],
    ) -> Result<GeneratedMessage> {
        let content = format!("Have a great day, {}.", subscriber.id);
        let fp = fingerprint(&content);
        Ok(GeneratedMessage {
            content,
            fingerprint: fp,
        })
    }
}

/// Records every accepted send; can fail the first N calls.
struct CountingSender {
    sent: Mutex<Vec<String>>,
    fail_remaining: AtomicU32,
}

impl CountingSender {
    fn new(fail_first: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(fail_first),
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SmsSender for CountingSender {
    async fn send(&self, phone: &str, _content: &str) -> Result<String> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DripfeedError::Send("gateway 503".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(phone.to_string());
        Ok(format!("SM{}", sent.len()))
    }
}

fn subscriber(id: &str, timezone: &str) -> Subscriber {
    Subscriber {
        id: id.to_string(),
        phone: format!("+1555555{:04}", id.len()),
        timezone: timezone.to_string(),
        window_start_hour: 12,
        window_end_hour: 17,
        active: true,
    }
}

fn open_limiter(db_path: &Path) -> Arc<dyn RateLimiter> {
    let mut params = HashMap::new();
    for name in [resource::GENERATION, resource::SMS] {
        params.insert(
            name.to_string(),
            BucketParams {
                capacity: 1000.0,
                refill_per_sec: 0.0,
            },
        );
    }
    Arc::new(SharedRateLimiter::open(db_path, params).unwrap())
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_attempts: 5,
        backoff: BackoffPolicy {
            base: std::time::Duration::from_secs(60),
            max: std::time::Duration::from_secs(3600),
            jitter: 0.0,
        },
        history_limit: 10,
        claim_lease: std::time::Duration::from_secs(900),
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, 0, 0).unwrap().and_utc()
}

/// Integration test: scheduling twice for the same day creates nothing new
#[test]
fn test_schedule_is_idempotent_per_day() -> Result<()> {
    let temp = TempDir::new()?;
    let store = Arc::new(DeliveryStore::open(&temp.path().join("d.db"))?);
    let subscribers = vec![subscriber("alice", "UTC"), subscriber("bob", "America/New_York")];
    for s in &subscribers {
        store.upsert_subscriber(s)?;
    }

    let scheduler = Scheduler::new(store.clone());
    let target = day(2026, 8, 27);

    let first = scheduler.schedule_day(&subscribers, target)?;
    assert_eq!(first.created, 2);

    let second = scheduler.schedule_day(&subscribers, target)?;
    assert_eq!(second.created, 0);
    assert_eq!(second.skipped, 2);
    Ok(())
}

/// Integration test: scheduled instants stay inside the local window across
/// the US spring-forward transition
#[test]
fn test_schedule_respects_dst_window() -> Result<()> {
    let temp = TempDir::new()?;
    let store = Arc::new(DeliveryStore::open(&temp.path().join("d.db"))?);
    let nyc = subscriber("nyc", "America/New_York");
    store.upsert_subscriber(&nyc)?;
    let scheduler = Scheduler::new(store.clone());

    // EST day: 12:00-17:00 local is 17:00-22:00 UTC
    let est_day = day(2024, 3, 3);
    scheduler.schedule_day(std::slice::from_ref(&nyc), est_day)?;
    let record = store.status_for("nyc", est_day)?.unwrap();
    assert!(record.scheduled_at >= at(est_day, 17));
    assert!(record.scheduled_at < at(est_day, 22));

    // EDT day (transition day): 12:00-17:00 local is 16:00-21:00 UTC
    let edt_day = day(2024, 3, 10);
    scheduler.schedule_day(std::slice::from_ref(&nyc), edt_day)?;
    let record = store.status_for("nyc", edt_day)?.unwrap();
    assert!(record.scheduled_at >= at(edt_day, 16));
    assert!(record.scheduled_at < at(edt_day, 21));

    let (start, end) = resolve_window("America/New_York", 12, 17, edt_day)?;
    assert_eq!(start.hour(), 16);
    assert_eq!(end.hour(), 21);
    Ok(())
}

/// Integration test: full schedule-then-tick pass sends one message per
/// subscriber, records history, and a second tick is a no-op
#[tokio::test]
async fn test_schedule_then_tick_delivers_once() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("d.db");
    let store = Arc::new(DeliveryStore::open(&db_path)?);
    let history = Arc::new(HistoryStore::open(&db_path)?);

    let subscribers = vec![subscriber("alice", "UTC"), subscriber("bob", "UTC")];
    for s in &subscribers {
        store.upsert_subscriber(s)?;
    }

    let target = day(2026, 8, 27);
    Scheduler::new(store.clone()).schedule_day(&subscribers, target)?;

    let sender = Arc::new(CountingSender::new(0));
    let worker = DeliveryWorker::new(
        store.clone(),
        history.clone(),
        open_limiter(&db_path),
        Arc::new(StubGenerator),
        sender.clone(),
        worker_config(),
    );

    // Past the end of every window, so everything is due
    let now = at(target, 23);
    let report = worker.tick_at(now).await?;
    assert_eq!(report.due, 2);
    assert_eq!(report.sent, 2);
    assert_eq!(sender.sent_count(), 2);
    assert_eq!(history.recent("alice", 10)?.len(), 1);

    // Everything already sent; nothing left to do
    let report = worker.tick_at(now).await?;
    assert_eq!(report.due, 0);
    assert_eq!(sender.sent_count(), 2);
    Ok(())
}

/// Integration test: two gateway failures then success leaves attempt_count
/// at 3 and exactly one message sent
#[tokio::test]
async fn test_retry_until_success_counts_attempts() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("d.db");
    let store = Arc::new(DeliveryStore::open(&db_path)?);
    let history = Arc::new(HistoryStore::open(&db_path)?);

    let alice = subscriber("alice", "UTC");
    store.upsert_subscriber(&alice)?;
    let target = day(2026, 8, 27);
    Scheduler::new(store.clone()).schedule_day(std::slice::from_ref(&alice), target)?;

    let sender = Arc::new(CountingSender::new(2));
    let worker = DeliveryWorker::new(
        store.clone(),
        history.clone(),
        open_limiter(&db_path),
        Arc::new(StubGenerator),
        sender.clone(),
        worker_config(),
    );

    // Tick 1 and 2 fail; backoff gates retries at +60s then +120s
    let mut now = at(target, 23);
    assert_eq!(worker.tick_at(now).await?.retrying, 1);
    now += chrono::Duration::seconds(61);
    assert_eq!(worker.tick_at(now).await?.retrying, 1);

    // Not yet eligible: next_attempt_at is 120s out
    now += chrono::Duration::seconds(61);
    assert_eq!(worker.tick_at(now).await?.due, 0);

    now += chrono::Duration::seconds(61);
    let report = worker.tick_at(now).await?;
    assert_eq!(report.sent, 1);

    let record = store.status_for("alice", target)?.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(sender.sent_count(), 1);
    Ok(())
}

/// Integration test: exhausting max_attempts finalizes the record as Failed
/// and later ticks never pick it up again
#[tokio::test]
async fn test_exhausted_attempts_are_terminal() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("d.db");
    let store = Arc::new(DeliveryStore::open(&db_path)?);
    let history = Arc::new(HistoryStore::open(&db_path)?);

    let alice = subscriber("alice", "UTC");
    store.upsert_subscriber(&alice)?;
    let target = day(2026, 8, 27);
    Scheduler::new(store.clone()).schedule_day(std::slice::from_ref(&alice), target)?;

    let sender = Arc::new(CountingSender::new(u32::MAX));
    let mut config = worker_config();
    config.max_attempts = 2;
    let worker = DeliveryWorker::new(
        store.clone(),
        history.clone(),
        open_limiter(&db_path),
        Arc::new(StubGenerator),
        sender.clone(),
        config,
    );

    let mut now = at(target, 23);
    assert_eq!(worker.tick_at(now).await?.retrying, 1);
    now += chrono::Duration::seconds(61);
    assert_eq!(worker.tick_at(now).await?.failed, 1);

    let record = store.status_for("alice", target)?.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 2);
    assert!(record.last_error.is_some());

    // Terminal: a much later tick sees nothing due
    now += chrono::Duration::days(1);
    assert_eq!(worker.tick_at(now).await?.due, 0);
    assert_eq!(sender.sent_count(), 0);
    Ok(())
}

/// Integration test: a shared bucket of capacity C grants exactly C
/// acquisitions across limiter instances in different "processes"
#[test]
fn test_shared_limiter_budget_across_instances() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("limits.db");
    let mut params = HashMap::new();
    params.insert(
        resource::SMS.to_string(),
        BucketParams {
            capacity: 5.0,
            refill_per_sec: 0.0,
        },
    );

    let a = SharedRateLimiter::open(&db_path, params.clone())?;
    let b = SharedRateLimiter::open(&db_path, params)?;

    let mut granted = 0;
    for i in 0..10 {
        let limiter = if i % 2 == 0 { &a } else { &b };
        if limiter.try_acquire(resource::SMS, 1)?.is_allowed() {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
    Ok(())
}

/// Integration test: two workers ticking the same database concurrently
/// never double-send; each due record is delivered exactly once
#[test]
fn test_concurrent_workers_send_each_record_once() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("d.db");

    let seed_store = DeliveryStore::open(&db_path)?;
    let subscribers: Vec<Subscriber> = (0..8)
        .map(|i| subscriber(&format!("sub{i}"), "UTC"))
        .collect();
    for s in &subscribers {
        seed_store.upsert_subscriber(s)?;
    }
    // A day safely in the past so the stale-claim lease never fires while
    // both workers hold live claims
    let target = day(2020, 6, 1);
    Scheduler::new(Arc::new(seed_store)).schedule_day(&subscribers, target)?;

    let sender = Arc::new(CountingSender::new(0));
    let now = at(target, 23);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let db_path = db_path.clone();
            let sender = sender.clone();
            std::thread::spawn(move || -> Result<usize> {
                let store = Arc::new(DeliveryStore::open(&db_path)?);
                let history = Arc::new(HistoryStore::open(&db_path)?);
                let worker = DeliveryWorker::new(
                    store,
                    history,
                    open_limiter(&db_path),
                    Arc::new(StubGenerator),
                    sender,
                    worker_config(),
                );
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(DripfeedError::Io)?;
                let report = runtime.block_on(worker.tick_at(now))?;
                Ok(report.sent)
            })
        })
        .collect();

    let mut total_sent = 0;
    for handle in handles {
        total_sent += handle.join().unwrap()?;
    }

    assert_eq!(total_sent, 8);
    assert_eq!(sender.sent_count(), 8);

    let verify = DeliveryStore::open(&db_path)?;
    for s in &subscribers {
        let record = verify.status_for(&s.id, target)?.unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.attempt_count, 1);
    }
    assert_eq!(verify.list_active()?.len(), 8);
    Ok(())
}

/// Integration test: repeated concurrent tick races, a fresh batch of due
/// records per round, keep every record at exactly one send
#[test]
fn test_repeated_concurrent_ticks_never_double_send() -> Result<()> {
    const ROUNDS: i64 = 25;

    let temp = TempDir::new()?;
    let db_path = temp.path().join("d.db");

    let subscribers: Vec<Subscriber> = (0..4)
        .map(|i| subscriber(&format!("sub{i}"), "UTC"))
        .collect();
    {
        let seed_store = DeliveryStore::open(&db_path)?;
        for s in &subscribers {
            seed_store.upsert_subscriber(s)?;
        }
    }

    let scheduler = Scheduler::new(Arc::new(DeliveryStore::open(&db_path)?));
    let sender = Arc::new(CountingSender::new(0));
    let mut total_sent = 0;

    for round in 0..ROUNDS {
        // Past days: live claims must never look stale to the other worker
        let target = day(2020, 1, 1) + chrono::Duration::days(round);
        let created = scheduler.schedule_day(&subscribers, target)?.created;
        assert_eq!(created, 4);
        let now = at(target, 23);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db_path = db_path.clone();
                let sender = sender.clone();
                std::thread::spawn(move || -> Result<usize> {
                    let store = Arc::new(DeliveryStore::open(&db_path)?);
                    let history = Arc::new(HistoryStore::open(&db_path)?);
                    let worker = DeliveryWorker::new(
                        store,
                        history,
                        open_limiter(&db_path),
                        Arc::new(StubGenerator),
                        sender,
                        worker_config(),
                    );
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(DripfeedError::Io)?;
                    let report = runtime.block_on(worker.tick_at(now))?;
                    Ok(report.sent)
                })
            })
            .collect();

        let mut round_sent = 0;
        for handle in handles {
            round_sent += handle.join().unwrap()?;
        }
        assert_eq!(round_sent, 4);
        total_sent += round_sent;
    }

    assert_eq!(total_sent as i64, ROUNDS * 4);
    assert_eq!(sender.sent_count() as i64, ROUNDS * 4);

    let verify = DeliveryStore::open(&db_path)?;
    for round in 0..ROUNDS {
        let target = day(2020, 1, 1) + chrono::Duration::days(round);
        for s in &subscribers {
            let record = verify.status_for(&s.id, target)?.unwrap();
            assert_eq!(record.status, DeliveryStatus::Sent);
            assert_eq!(record.attempt_count, 1);
        }
    }
    Ok(())
}
