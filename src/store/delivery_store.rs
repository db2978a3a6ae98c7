//! SQLite-backed persistence for deliveries and subscribers.
//!
//! All state transitions on a `DeliveryRecord` go through the conditional
//! UPDATE operations here. The claim step (`claim`) is a compare-and-swap on
//! the status column, so concurrent worker processes pointing at the same
//! database file can never both process one record. WAL mode plus a busy
//! timeout keeps cross-process writers from tripping over each other.

use crate::error::{DripfeedError, Result};
use crate::provider::SubscriberDirectory;
use crate::store::records::{DeliveryRecord, DeliveryStatus, Subscriber};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Store for delivery records and the subscriber directory table.
pub struct DeliveryStore {
    conn: Mutex<Connection>,
}

impl DeliveryStore {
    /// Open or create the store at the given database path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                subscriber_id TEXT NOT NULL,
                day TEXT NOT NULL,
                scheduled_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                last_error TEXT,
                content TEXT,
                content_fingerprint TEXT,
                sent_at INTEGER,
                receipt_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_deliveries_open
                ON deliveries(subscriber_id, day)
                WHERE status IN ('pending', 'in_progress');

            CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status);
            CREATE INDEX IF NOT EXISTS idx_deliveries_scheduled ON deliveries(scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_deliveries_day ON deliveries(subscriber_id, day);

            CREATE TABLE IF NOT EXISTS subscribers (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL,
                timezone TEXT NOT NULL,
                window_start_hour INTEGER NOT NULL,
                window_end_hour INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Insert a freshly-scheduled delivery.
    ///
    /// Returns `Ok(false)` when the partial unique index rejects a second
    /// open record for the same (subscriber, day) — the idempotent-skip path
    /// when two scheduler invocations race.
    pub fn insert(&self, record: &DeliveryRecord) -> Result<bool> {
        let result = self.conn().execute(
            r#"
            INSERT INTO deliveries
            (id, subscriber_id, day, scheduled_at, status, attempt_count, next_attempt_at,
             last_error, content, content_fingerprint, sent_at, receipt_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                record.id,
                record.subscriber_id,
                record.day.format(DAY_FORMAT).to_string(),
                record.scheduled_at.timestamp_millis(),
                record.status.as_str(),
                record.attempt_count,
                record.next_attempt_at.map(|at| at.timestamp_millis()),
                record.last_error,
                record.content,
                record.content_fingerprint,
                record.sent_at.map(|at| at.timestamp_millis()),
                record.receipt_id,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a delivery record by ID.
    pub fn get(&self, id: &str) -> Result<Option<DeliveryRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT * FROM deliveries WHERE id = ?1",
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Check whether a non-terminal record exists for (subscriber, day).
    pub fn has_open_delivery(&self, subscriber_id: &str, day: NaiveDate) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            r#"
            SELECT COUNT(*) FROM deliveries
            WHERE subscriber_id = ?1 AND day = ?2
              AND status IN ('pending', 'in_progress')
            "#,
            params![subscriber_id, day.format(DAY_FORMAT).to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All pending deliveries due at `now`: scheduled instant reached and any
    /// retry backoff elapsed.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM deliveries
            WHERE status = 'pending'
              AND scheduled_at <= ?1
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
            ORDER BY scheduled_at
            "#,
        )?;

        let rows = stmt.query_map([now.timestamp_millis()], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Atomically claim a pending delivery: Pending -> InProgress.
    ///
    /// Single conditional UPDATE; returns false when another worker already
    /// claimed the record or its status moved on.
    pub fn claim(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = 'in_progress', updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, Utc::now().timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Release a claimed delivery back to Pending after a rate-limit denial.
    ///
    /// A throttle is not a failure: attempt_count stays untouched. The
    /// backoff gate keeps the record out of the due set until tokens can
    /// plausibly have accrued.
    pub fn release_throttled(&self, id: &str, next_attempt_at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = 'pending', next_attempt_at = ?2, updated_at = ?3
            WHERE id = ?1 AND status = 'in_progress'
            "#,
            params![
                id,
                next_attempt_at.timestamp_millis(),
                Utc::now().timestamp_millis()
            ],
        )?;

        if changed == 1 {
            Ok(())
        } else {
            Err(DripfeedError::InvalidState(format!(
                "cannot release delivery {id}: not in progress"
            )))
        }
    }

    /// Release InProgress claims not touched since `cutoff` back to Pending.
    ///
    /// Covers workers that crashed between claiming and finalizing; every
    /// transition bumps updated_at, so a live claim is never older than the
    /// slowest generate-plus-send round trip.
    pub fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = 'pending', updated_at = ?2
            WHERE status = 'in_progress' AND updated_at < ?1
            "#,
            params![cutoff.timestamp_millis(), Utc::now().timestamp_millis()],
        )?;
        Ok(changed)
    }

    /// Record a failed attempt on a claimed delivery.
    ///
    /// Increments attempt_count. With `retry_at` set the record returns to
    /// Pending behind the backoff gate; without it the record is finalized
    /// as terminal Failed.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (status, next_ms) = match retry_at {
            Some(at) => ("pending", Some(at.timestamp_millis())),
            None => ("failed", None),
        };

        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = ?2, attempt_count = attempt_count + 1,
                last_error = ?3, next_attempt_at = ?4, updated_at = ?5
            WHERE id = ?1 AND status = 'in_progress'
            "#,
            params![id, status, error, next_ms, Utc::now().timestamp_millis()],
        )?;

        if changed == 1 {
            Ok(())
        } else {
            Err(DripfeedError::InvalidState(format!(
                "cannot fail delivery {id}: not in progress"
            )))
        }
    }

    /// Finalize a claimed delivery as Sent, recording the gateway receipt.
    ///
    /// The successful attempt counts toward attempt_count like any other.
    pub fn mark_sent(&self, id: &str, receipt_id: &str, sent_at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = 'sent', attempt_count = attempt_count + 1,
                sent_at = ?2, receipt_id = ?3, next_attempt_at = NULL, updated_at = ?4
            WHERE id = ?1 AND status = 'in_progress'
            "#,
            params![
                id,
                sent_at.timestamp_millis(),
                receipt_id,
                Utc::now().timestamp_millis()
            ],
        )?;

        if changed == 1 {
            Ok(())
        } else {
            Err(DripfeedError::InvalidState(format!(
                "cannot mark delivery {id} sent: not in progress"
            )))
        }
    }

    /// Finalize a delivery as Cancelled.
    ///
    /// Allowed from Pending (external opt-out) and from InProgress (worker
    /// observed an inactive subscriber right after claiming).
    pub fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET status = 'cancelled', updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'in_progress')
            "#,
            params![id, Utc::now().timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Persist generated content on a claimed delivery.
    ///
    /// Set once; retries reuse the stored content so a resend is idempotent.
    pub fn set_content(&self, id: &str, content: &str, fingerprint: &str) -> Result<()> {
        let changed = self.conn().execute(
            r#"
            UPDATE deliveries
            SET content = ?2, content_fingerprint = ?3, updated_at = ?4
            WHERE id = ?1 AND status = 'in_progress'
            "#,
            params![id, content, fingerprint, Utc::now().timestamp_millis()],
        )?;

        if changed == 1 {
            Ok(())
        } else {
            Err(DripfeedError::InvalidState(format!(
                "cannot set content on delivery {id}: not in progress"
            )))
        }
    }

    /// Status query for monitoring: the delivery for (subscriber, day).
    ///
    /// Returns the most recently created record when terminal history exists
    /// alongside a fresh one.
    pub fn status_for(&self, subscriber_id: &str, day: NaiveDate) -> Result<Option<DeliveryRecord>> {
        let record = self
            .conn()
            .query_row(
                r#"
                SELECT * FROM deliveries
                WHERE subscriber_id = ?1 AND day = ?2
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                params![subscriber_id, day.format(DAY_FORMAT).to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Count deliveries by status, for reporting.
    pub fn count_by_status(&self, status: DeliveryStatus) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM deliveries WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Get a subscriber by id.
    pub fn get_subscriber(&self, id: &str) -> Result<Option<Subscriber>> {
        let subscriber = self
            .conn()
            .query_row(
                "SELECT id, phone, timezone, window_start_hour, window_end_hour, active
                 FROM subscribers WHERE id = ?1",
                [id],
                row_to_subscriber,
            )
            .optional()?;
        Ok(subscriber)
    }

    /// Insert or replace a subscriber row.
    ///
    /// Directory maintenance belongs to the external user-management side;
    /// this exists for seeding and tests.
    pub fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn().execute(
            r#"
            INSERT INTO subscribers
            (id, phone, timezone, window_start_hour, window_end_hour, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                phone = excluded.phone,
                timezone = excluded.timezone,
                window_start_hour = excluded.window_start_hour,
                window_end_hour = excluded.window_end_hour,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
            params![
                subscriber.id,
                subscriber.phone,
                subscriber.timezone,
                subscriber.window_start_hour,
                subscriber.window_end_hour,
                subscriber.active,
                now,
            ],
        )?;
        Ok(())
    }
}

impl SubscriberDirectory for DeliveryStore {
    fn list_active(&self) -> Result<Vec<Subscriber>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, phone, timezone, window_start_hour, window_end_hour, active
             FROM subscribers WHERE active = 1 ORDER BY id",
        )?;

        let rows = stmt.query_map([], row_to_subscriber)?;
        let mut subscribers = Vec::new();
        for row in rows {
            subscribers.push(row?);
        }
        Ok(subscribers)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<DeliveryRecord> {
    let day_str: String = row.get("day")?;
    let status_str: String = row.get("status")?;

    Ok(DeliveryRecord {
        id: row.get("id")?,
        subscriber_id: row.get("subscriber_id")?,
        day: NaiveDate::parse_from_str(&day_str, DAY_FORMAT)
            .map_err(|e| conversion_err(format!("bad day '{day_str}': {e}")))?,
        scheduled_at: dt_from_ms(row.get("scheduled_at")?)?,
        status: DeliveryStatus::from_str(&status_str)
            .ok_or_else(|| conversion_err(format!("unknown status '{status_str}'")))?,
        attempt_count: row.get("attempt_count")?,
        next_attempt_at: opt_dt_from_ms(row.get("next_attempt_at")?)?,
        last_error: row.get("last_error")?,
        content: row.get("content")?,
        content_fingerprint: row.get("content_fingerprint")?,
        sent_at: opt_dt_from_ms(row.get("sent_at")?)?,
        receipt_id: row.get("receipt_id")?,
        created_at: dt_from_ms(row.get("created_at")?)?,
        updated_at: dt_from_ms(row.get("updated_at")?)?,
    })
}

fn row_to_subscriber(row: &Row) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        phone: row.get(1)?,
        timezone: row.get(2)?,
        window_start_hour: row.get(3)?,
        window_end_hour: row.get(4)?,
        active: row.get(5)?,
    })
}

fn dt_from_ms(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_err(format!("timestamp out of range: {ms}")))
}

fn opt_dt_from_ms(ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(dt_from_ms).transpose()
}

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}
