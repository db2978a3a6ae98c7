//! Sent-message history for content dedup.
//!
//! Records a fingerprint per delivered message so generation can avoid
//! repeating recent content. Retention pruning is exposed for the host's
//! cleanup job.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;

/// Store for per-subscriber sent-message fingerprints.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open or create the history store at the given database path.
    ///
    /// Shares a database file with `DeliveryStore` in normal deployments;
    /// each store owns its own tables and connection.
    pub fn open(db_path: &Path) -> Result<Self> {
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
            CREATE TABLE IF NOT EXISTS message_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subscriber_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_subscriber
                ON message_history(subscriber_id, sent_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Record a sent fingerprint for a subscriber.
    pub fn record(&self, subscriber_id: &str, fingerprint: &str, sent_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO message_history (subscriber_id, fingerprint, sent_at) VALUES (?1, ?2, ?3)",
            params![subscriber_id, fingerprint, sent_at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// The most recent fingerprints for a subscriber, newest first.
    pub fn recent(&self, subscriber_id: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT fingerprint FROM message_history
             WHERE subscriber_id = ?1
             ORDER BY sent_at DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![subscriber_id, limit as i64], |row| row.get(0))?;
        let mut fingerprints = Vec::new();
        for row in rows {
            fingerprints.push(row?);
        }
        Ok(fingerprints)
    }

    /// Delete history entries older than the cutoff. Returns rows deleted.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM message_history WHERE sent_at < ?1",
            [cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}
