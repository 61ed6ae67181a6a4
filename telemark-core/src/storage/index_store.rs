use crate::model::{HashIndexEntry, HistoryKind};
use crate::{Result, TelemarkError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;

/// Per-device SQLite index: the hash index of the content store and the
/// bounded history series.
pub struct IndexStore {
    db_path: PathBuf,
}

impl IndexStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS hash_index (
                hash TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_kind ON history(kind, id)",
            [],
        )?;

        Ok(())
    }

    /// Insert or refresh the timestamp recorded for a hash.
    pub fn put_hash_entry(&self, hash: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO hash_index (hash, timestamp) VALUES (?1, ?2)
             ON CONFLICT(hash) DO UPDATE SET timestamp = excluded.timestamp",
            params![hash, timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_hash_entry(&self, hash: &str) -> Result<Option<HashIndexEntry>> {
        let conn = self.get_conn()?;

        let timestamp: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM hash_index WHERE hash = ?1",
                [hash],
                |row| row.get(0),
            )
            .optional()?;

        match timestamp {
            Some(timestamp) => Ok(Some(HashIndexEntry {
                hash: hash.to_string(),
                timestamp: parse_timestamp(&timestamp)?,
            })),
            None => Ok(None),
        }
    }

    pub fn remove_hash_entry(&self, hash: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM hash_index WHERE hash = ?1", [hash])?;
        Ok(affected > 0)
    }

    pub fn list_hash_entries(&self) -> Result<Vec<HashIndexEntry>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT hash, timestamp FROM hash_index ORDER BY timestamp, hash")?;

        let rows = stmt.query_map([], |row| {
            let hash: String = row.get(0)?;
            let timestamp: String = row.get(1)?;
            Ok((hash, timestamp))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (hash, timestamp) = row?;
            entries.push(HashIndexEntry {
                hash,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }

        Ok(entries)
    }

    /// Append one entry and trim the series to its newest `limit` rows in the
    /// same transaction.
    pub fn append_history(
        &self,
        kind: HistoryKind,
        timestamp: DateTime<Utc>,
        payload: &str,
        limit: usize,
    ) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO history (kind, timestamp, payload) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), timestamp.to_rfc3339(), payload],
        )?;

        tx.execute(
            "DELETE FROM history WHERE kind = ?1 AND id NOT IN (
                SELECT id FROM history WHERE kind = ?1 ORDER BY id DESC LIMIT ?2
            )",
            params![kind.as_str(), limit as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Payloads of one series in arrival order.
    pub fn list_history(&self, kind: HistoryKind) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM history WHERE kind = ?1 ORDER BY id")?;

        let rows = stmt.query_map([kind.as_str()], |row| row.get::<_, String>(0))?;

        let mut payloads = Vec::new();
        for row in rows {
            payloads.push(row?);
        }

        Ok(payloads)
    }

    /// Empty the hash index and both history series in one transaction.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM hash_index", [])?;
        tx.execute("DELETE FROM history", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TelemarkError::Internal(format!("invalid stored timestamp {}: {}", value, e)))
}
