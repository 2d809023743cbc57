/// SQLite-backed durable store for messages, channels, and summaries.
///
/// One connection behind an async mutex. Messages are keyed by
/// `(channel_id, message_id)` and written with `INSERT OR IGNORE` inside a
/// per-batch transaction, so re-ingesting overlapping pages is a no-op.
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use chatdigest_core::{
    AppendOutcome, CacheEntry, ChannelInfo, Fingerprint, Message, MessageStore, RawMessage,
    SummaryStore,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS channels (
        channel_id  TEXT PRIMARY KEY,
        server_id   TEXT NOT NULL,
        name        TEXT NOT NULL,
        created_at  TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS messages (
        channel_id   TEXT NOT NULL,
        message_id   TEXT NOT NULL,
        author_id    TEXT NOT NULL,
        author_name  TEXT NOT NULL,
        text         TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        PRIMARY KEY (channel_id, message_id)
    );
    CREATE TABLE IF NOT EXISTS sync_status (
        channel_id     TEXT PRIMARY KEY,
        last_synced_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS channel_summaries (
        channel_id         TEXT PRIMARY KEY,
        server_id          TEXT NOT NULL,
        fingerprint        TEXT NOT NULL,
        summary            TEXT NOT NULL,
        message_count      INTEGER NOT NULL,
        total_participants INTEGER NOT NULL,
        last_active_ms     INTEGER NOT NULL,
        generated_at_ms    INTEGER NOT NULL,
        window_start_ms    INTEGER NOT NULL,
        window_end_ms      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_channels_server ON channels (server_id);
    CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages (channel_id, timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_summaries_server ON channel_summaries (server_id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize digest schema")?;

        info!(path = ?path.as_ref(), journal_mode = %mode, "SqliteStore opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn upsert_channel(&self, channel: &ChannelInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO channels (channel_id, server_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET server_id = excluded.server_id, name = excluded.name",
            params![channel.channel_id, channel.server_id, channel.name],
        )?;
        Ok(())
    }

    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT channel_id, server_id, name FROM channels WHERE server_id = ?1 ORDER BY name",
        )?;
        let channels = stmt
            .query_map(params![server_id], |row| {
                Ok(ChannelInfo {
                    channel_id: row.get(0)?,
                    server_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(channels)
    }

    async fn append(&self, channel_id: &str, messages: Vec<RawMessage>) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        let mut valid = Vec::with_capacity(messages.len());
        for raw in messages {
            match raw.into_message(channel_id) {
                Ok(msg) => valid.push(msg),
                Err(e) => {
                    warn!(channel_id = %channel_id, error = %e, "Rejected malformed message");
                    outcome.rejected += 1;
                }
            }
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO messages
                 (channel_id, message_id, author_id, author_name, text, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for msg in &valid {
                let changed = stmt.execute(params![
                    msg.channel_id,
                    msg.message_id,
                    msg.author_id,
                    msg.author_name,
                    msg.text,
                    msg.timestamp.timestamp_millis(),
                ])?;
                if changed == 1 {
                    outcome.inserted += 1;
                } else {
                    outcome.duplicates += 1;
                }
            }
        }
        tx.commit().context("Failed to commit message batch")?;

        debug!(
            channel_id = %channel_id,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "Appended message batch"
        );
        Ok(outcome)
    }

    async fn query(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT channel_id, message_id, author_id, author_name, text, timestamp_ms
             FROM messages
             WHERE channel_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
             ORDER BY timestamp_ms ASC, message_id ASC",
        )?;
        let messages = stmt
            .query_map(
                params![channel_id, since.timestamp_millis(), until.timestamp_millis()],
                row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn latest_timestamp(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp_ms) FROM messages WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?;
        latest
            .map(|ms| millis_to_datetime(0, ms).map_err(anyhow::Error::from))
            .transpose()
    }

    async fn record_sync(&self, channel_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sync_status (channel_id, last_synced_ms) VALUES (?1, ?2)",
            params![channel_id, at.timestamp_millis()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SummaryStore for SqliteStore {
    async fn load_summary(&self, channel_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                "SELECT channel_id, server_id, fingerprint, summary, message_count,
                        total_participants, last_active_ms, generated_at_ms,
                        window_start_ms, window_end_ms
                 FROM channel_summaries WHERE channel_id = ?1",
                params![channel_id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    async fn save_summary(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO channel_summaries
             (channel_id, server_id, fingerprint, summary, message_count, total_participants,
              last_active_ms, generated_at_ms, window_start_ms, window_end_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.channel_id,
                entry.server_id,
                entry.fingerprint.as_str(),
                entry.summary,
                entry.message_count as i64,
                entry.total_participants as i64,
                entry.last_active.timestamp_millis(),
                entry.generated_at.timestamp_millis(),
                entry.window_start.timestamp_millis(),
                entry.window_end.timestamp_millis(),
            ],
        )?;
        debug!(channel_id = %entry.channel_id, fingerprint = %entry.fingerprint, "Saved summary");
        Ok(())
    }

    async fn clear_summaries(&self, server_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM channel_summaries
             WHERE server_id = ?1
                OR channel_id IN (SELECT channel_id FROM channels WHERE server_id = ?1)",
            params![server_id],
        )?;
        info!(server_id = %server_id, deleted, "Cleared stored summaries");
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Row deserialization helpers
// ---------------------------------------------------------------------------

fn millis_to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        channel_id: row.get(0)?,
        message_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        text: row.get(4)?,
        timestamp: millis_to_datetime(5, row.get(5)?)?,
    })
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
    let fingerprint: String = row.get(2)?;
    let message_count: i64 = row.get(4)?;
    let total_participants: i64 = row.get(5)?;
    Ok(CacheEntry {
        channel_id: row.get(0)?,
        server_id: row.get(1)?,
        fingerprint: Fingerprint::new(fingerprint),
        summary: row.get(3)?,
        message_count: usize::try_from(message_count)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, message_count))?,
        total_participants: usize::try_from(total_participants)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, total_participants))?,
        last_active: millis_to_datetime(6, row.get(6)?)?,
        generated_at: millis_to_datetime(7, row.get(7)?)?,
        window_start: millis_to_datetime(8, row.get(8)?)?,
        window_end: millis_to_datetime(9, row.get(9)?)?,
    })
}
