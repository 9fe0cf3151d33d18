//! SQLite snapshot storage for personality ledgers
//!
//! One row per memory entry, indexed by personality and timestamp. `seq`
//! records the position in the ledger so insertion order survives a reload.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{MemoryEntry, MemoryMetadata, MemoryTier};

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the snapshot database named by the config
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    /// Open (or create) a snapshot database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| Error::unavailable(format!("{}: {}", path.display(), e)))?;

        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| Error::unavailable(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::unavailable(e.to_string()))
    }

    /// Replace the stored snapshot of a personality's ledger
    pub fn save_ledger(&self, personality_id: &str, entries: &[MemoryEntry]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM memory_entries WHERE personality_id = ?1",
            params![personality_id],
        )?;

        insert_entries(&tx, personality_id, entries)?;

        tx.commit()?;
        tracing::debug!(personality_id, count = entries.len(), "Saved ledger snapshot");
        Ok(())
    }

    /// Replace the whole stored snapshot with `ledgers` in one transaction.
    /// Personalities absent from `ledgers` lose their stored rows.
    pub fn replace_all(&self, ledgers: &[(String, Vec<MemoryEntry>)]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let dropped = tx.execute("DELETE FROM memory_entries", [])?;
        let mut saved = 0;
        for (personality_id, entries) in ledgers {
            insert_entries(&tx, personality_id, entries)?;
            saved += entries.len();
        }

        tx.commit()?;
        tracing::debug!(saved, dropped, "Replaced ledger snapshot");
        Ok(saved)
    }

    /// Load a personality's ledger in its original order
    pub fn load_ledger(&self, personality_id: &str) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, content, tier, timestamp, user_id, channel_id,
                   importance, sentiment, topics
            FROM memory_entries WHERE personality_id = ?1
            ORDER BY seq
            "#,
        )?;

        let rows = stmt.query_map(params![personality_id], |row| {
            Ok(EntryRow {
                id: row.get(0)?,
                content: row.get(1)?,
                tier: row.get(2)?,
                timestamp: row.get(3)?,
                user_id: row.get(4)?,
                channel_id: row.get(5)?,
                importance: row.get(6)?,
                sentiment: row.get(7)?,
                topics: row.get(8)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }

        Ok(entries)
    }

    /// Delete a personality's stored snapshot
    pub fn delete_ledger(&self, personality_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM memory_entries WHERE personality_id = ?1",
            params![personality_id],
        )?;
        Ok(deleted)
    }

    /// Personalities with a stored snapshot
    pub fn list_personalities(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT personality_id FROM memory_entries ORDER BY personality_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }
}

fn insert_entries(conn: &Connection, personality_id: &str, entries: &[MemoryEntry]) -> Result<()> {
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO memory_entries (
            id, personality_id, seq, content, tier, timestamp,
            user_id, channel_id, importance, sentiment, topics
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )?;

    for (seq, entry) in entries.iter().enumerate() {
        stmt.execute(params![
            entry.id.to_string(),
            personality_id,
            seq as i64,
            entry.content,
            entry.tier.to_string(),
            entry.timestamp.to_rfc3339(),
            entry.metadata.user_id,
            entry.metadata.channel_id,
            entry.metadata.importance,
            entry.metadata.sentiment,
            serde_json::to_string(&entry.metadata.topics)?,
        ])?;
    }
    Ok(())
}

/// Intermediate struct for reading from SQLite
struct EntryRow {
    id: String,
    content: String,
    tier: String,
    timestamp: String,
    user_id: Option<String>,
    channel_id: Option<String>,
    importance: f64,
    sentiment: Option<String>,
    topics: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<MemoryEntry> {
        let tier: MemoryTier = self
            .tier
            .parse()
            .map_err(|_| Error::corrupt(format!("Unknown tier: {}", self.tier)))?;

        Ok(MemoryEntry {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::corrupt(e.to_string()))?,
            content: self.content,
            timestamp: chrono::DateTime::parse_from_rfc3339(&self.timestamp)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| Error::corrupt(e.to_string()))?,
            tier,
            metadata: MemoryMetadata {
                user_id: self.user_id,
                channel_id: self.channel_id,
                importance: self.importance,
                sentiment: self.sentiment,
                topics: serde_json::from_str(&self.topics)
                    .map_err(|e| Error::corrupt(format!("Bad topics: {}", e)))?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample() -> Vec<MemoryEntry> {
        let t = Utc.with_ymd_and_hms(2024, 2, 2, 8, 0, 0).unwrap();
        vec![
            MemoryEntry::new(
                "I love cats",
                MemoryTier::LongTerm,
                MemoryMetadata::default()
                    .with_user("u1")
                    .with_channel("c9")
                    .with_importance(1.25)
                    .with_sentiment("positive")
                    .with_topics(["pets"]),
                t,
            ),
            MemoryEntry::new("hi", MemoryTier::ShortTerm, MemoryMetadata::default(), t),
        ]
    }

    #[test]
    fn test_snapshot_round_trip_preserves_order_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("memory.db")).unwrap();
        let entries = sample();

        storage.save_ledger("p1", &entries).unwrap();
        assert_eq!(storage.load_ledger("p1").unwrap(), entries);
        assert!(storage.load_ledger("p2").unwrap().is_empty());
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("memory.db")).unwrap();
        let entries = sample();

        storage.save_ledger("p1", &entries).unwrap();
        storage.save_ledger("p1", &entries[1..]).unwrap();
        storage.save_ledger("p2", &entries[..1]).unwrap();

        assert_eq!(storage.load_ledger("p1").unwrap(), entries[1..].to_vec());
        assert_eq!(storage.list_personalities().unwrap(), vec!["p1", "p2"]);
        assert_eq!(storage.delete_ledger("p2").unwrap(), 1);
        assert_eq!(storage.list_personalities().unwrap(), vec!["p1"]);
    }

    #[test]
    fn test_undecodable_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("memory.db")).unwrap();
        storage.save_ledger("p1", &sample()).unwrap();

        storage
            .lock()
            .unwrap()
            .execute("UPDATE memory_entries SET tier = 'medium_term'", [])
            .unwrap();

        assert!(matches!(storage.load_ledger("p1"), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_replace_all_drops_personalities_not_given() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("memory.db")).unwrap();
        let entries = sample();
        storage.save_ledger("gone", &entries).unwrap();
        storage.save_ledger("kept", &entries[..1]).unwrap();

        let saved = storage
            .replace_all(&[("kept".to_string(), entries.clone())])
            .unwrap();

        assert_eq!(saved, 2);
        assert_eq!(storage.list_personalities().unwrap(), vec!["kept"]);
        assert_eq!(storage.load_ledger("kept").unwrap(), entries);
        assert!(storage.load_ledger("gone").unwrap().is_empty());
    }

    #[test]
    fn test_unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("memory.db");
        assert!(matches!(SqliteStorage::open(path), Err(Error::Unavailable(_))));
    }
}
