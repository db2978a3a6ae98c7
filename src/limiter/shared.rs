//! Cross-process rate limiter backend over SQLite.
//!
//! Bucket state lives in a `rate_buckets` table; the refill-and-debit runs
//! inside a single immediate transaction, so concurrent `try_acquire` calls
//! from different worker processes serialize on the database write lock and
//! can never jointly overspend a bucket.

use super::bucket::{BucketParams, TokenBucket};
use super::{Decision, RateLimiter, now_ms};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed token buckets shared across worker processes.
///
/// Capacity and refill rate come from config at acquire time, not from the
/// table, so limit changes apply on restart without a migration.
pub struct SharedRateLimiter {
    conn: Mutex<Connection>,
    params: HashMap<String, BucketParams>,
}

impl SharedRateLimiter {
    /// Open or create the shared limiter at the given database path.
    pub fn open(db_path: &Path, params: HashMap<String, BucketParams>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rate_buckets (
                resource TEXT PRIMARY KEY,
                tokens REAL NOT NULL,
                last_refill_ms INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            params,
        })
    }

    /// `try_acquire` with an explicit clock, for tests.
    pub fn try_acquire_at(&self, resource: &str, cost: u32, now_ms: i64) -> Result<Decision> {
        let Some(params) = self.params.get(resource) else {
            return Ok(Decision::Allowed);
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(f64, i64)> = tx
            .query_row(
                "SELECT tokens, last_refill_ms FROM rate_buckets WHERE resource = ?1",
                [resource],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let mut bucket = match row {
            Some((tokens, last_refill_ms)) => TokenBucket {
                tokens,
                last_refill_ms,
            },
            None => TokenBucket::full(params, now_ms),
        };

        let decision = bucket.try_debit(params, cost as f64, now_ms);

        tx.execute(
            r#"
            INSERT INTO rate_buckets (resource, tokens, last_refill_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(resource) DO UPDATE SET
                tokens = excluded.tokens,
                last_refill_ms = excluded.last_refill_ms
            "#,
            params![resource, bucket.tokens, bucket.last_refill_ms],
        )?;
        tx.commit()?;

        if let Decision::Denied { retry_after } = decision {
            tracing::debug!(
                resource,
                cost,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit denied"
            );
        }
        Ok(decision)
    }
}

impl RateLimiter for SharedRateLimiter {
    fn try_acquire(&self, resource: &str, cost: u32) -> Result<Decision> {
        self.try_acquire_at(resource, cost, now_ms())
    }
}
