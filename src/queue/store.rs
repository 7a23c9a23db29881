//! Durable key-ordered store backing the queue.
//!
//! SQLite tables, one row per committed batch. Keys are allocated from a
//! persisted counter so they increase monotonically and are never reused,
//! even after entries are swept. Bookmark writes and oldest-entry drops are
//! single transactions: after a crash either the old or the new state is
//! observed, never a torn one.

use std::path::Path;
use std::sync::{Arc, Mutex};

use miette::Diagnostic;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("queue store: {0}")]
    #[diagnostic(code(tributary::queue::store))]
    Sqlite(#[from] rusqlite::Error),

    #[error("queue store: {0}")]
    #[diagnostic(code(tributary::queue::store_io))]
    Io(#[from] std::io::Error),
}

/// Key-ordered payload store with per-writer bookmarks.
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
    /// Open (or create) the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("queue.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS signals (
                key INTEGER PRIMARY KEY,
                payload BLOB NOT NULL,
                newest_ts INTEGER NOT NULL,
                bytes INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bookmarks (
                name TEXT PRIMARY KEY,
                key INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                k TEXT PRIMARY KEY,
                v INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_signals_newest_ts ON signals(newest_ts)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a payload under the next key. Keys increase monotonically
    /// across restarts and sweeps.
    pub fn append(&self, payload: &[u8], newest_ts: i64) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let last: i64 = tx
            .query_row("SELECT v FROM meta WHERE k = 'last_key'", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);
        let key = last + 1;
        tx.execute(
            "INSERT INTO signals (key, payload, newest_ts, bytes) VALUES (?1, ?2, ?3, ?4)",
            params![key, payload, newest_ts, payload.len() as i64],
        )?;
        tx.execute(
            "INSERT INTO meta (k, v) VALUES ('last_key', ?1)
             ON CONFLICT(k) DO UPDATE SET v = ?1",
            params![key],
        )?;
        tx.commit()?;
        Ok(key as u64)
    }

    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock();
        let payload = conn
            .query_row(
                "SELECT payload FROM signals WHERE key = ?1",
                params![key as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    pub fn oldest_key(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let key: Option<i64> =
            conn.query_row("SELECT MIN(key) FROM signals", [], |row| row.get(0))?;
        Ok(key.map(|k| k as u64))
    }

    pub fn newest_key(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let key: Option<i64> =
            conn.query_row("SELECT MAX(key) FROM signals", [], |row| row.get(0))?;
        Ok(key.map(|k| k as u64))
    }

    /// First key strictly greater than `after`, skipping any swept gaps.
    pub fn next_key(&self, after: u64) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let key: Option<i64> = conn.query_row(
            "SELECT MIN(key) FROM signals WHERE key > ?1",
            params![after as i64],
            |row| row.get(0),
        )?;
        Ok(key.map(|k| k as u64))
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn total_bytes(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM signals",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    pub fn read_bookmark(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let key: Option<i64> = conn
            .query_row(
                "SELECT key FROM bookmarks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key.map(|k| k as u64))
    }

    /// Persist the last-delivered key for a writer. A single statement, so
    /// a crash observes either the previous or the new bookmark.
    pub fn write_bookmark(&self, name: &str, key: u64) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO bookmarks (name, key) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET key = ?2",
            params![name, key as i64],
        )?;
        Ok(())
    }

    /// Drop entries whose newest contained timestamp is older than
    /// `cutoff_ts` and advance bookmarks past the holes. Returns the number
    /// of dropped entries.
    pub fn sweep_expired(&self, cutoff_ts: i64) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let dropped = tx.execute(
            "DELETE FROM signals WHERE newest_ts < ?1",
            params![cutoff_ts],
        )?;
        if dropped > 0 {
            Self::advance_bookmarks(&tx)?;
        }
        tx.commit()?;
        Ok(dropped as u64)
    }

    /// Drop oldest entries until the stored bytes fit under `max_bytes`.
    /// Returns the number of dropped entries.
    pub fn drop_oldest_until(&self, max_bytes: u64) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut dropped = 0u64;
        loop {
            let total: i64 = tx.query_row(
                "SELECT COALESCE(SUM(bytes), 0) FROM signals",
                [],
                |row| row.get(0),
            )?;
            if total as u64 <= max_bytes {
                break;
            }
            let oldest: Option<i64> =
                tx.query_row("SELECT MIN(key) FROM signals", [], |row| row.get(0))?;
            let Some(oldest) = oldest else { break };
            tx.execute("DELETE FROM signals WHERE key = ?1", params![oldest])?;
            dropped += 1;
        }
        if dropped > 0 {
            Self::advance_bookmarks(&tx)?;
        }
        tx.commit()?;
        Ok(dropped)
    }

    /// Move every bookmark forward over keys that no longer exist, without
    /// ever skipping a live entry: the new value is one less than the next
    /// remaining key (or the last allocated key when nothing remains).
    fn advance_bookmarks(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
        let last: i64 = tx
            .query_row("SELECT v FROM meta WHERE k = 'last_key'", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);
        let bookmarks: Vec<(String, i64)> = tx
            .prepare("SELECT name, key FROM bookmarks")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        for (name, key) in bookmarks {
            let next: Option<i64> = tx.query_row(
                "SELECT MIN(key) FROM signals WHERE key > ?1",
                params![key],
                |row| row.get(0),
            )?;
            let advanced = match next {
                Some(next) => next - 1,
                None => last,
            };
            if advanced > key {
                tx.execute(
                    "UPDATE bookmarks SET key = ?1 WHERE name = ?2",
                    params![advanced, name],
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn keys_are_monotonic_and_never_reused() {
        let (_dir, store) = open_store();
        let k1 = store.append(b"one", 100).unwrap();
        let k2 = store.append(b"two", 200).unwrap();
        assert_eq!((k1, k2), (1, 2));

        // Sweeping everything must not recycle keys.
        store.sweep_expired(1_000).unwrap();
        assert!(store.is_empty().unwrap());
        let k3 = store.append(b"three", 300).unwrap();
        assert_eq!(k3, 3);
    }

    #[test]
    fn keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = QueueStore::open(dir.path()).unwrap();
            store.append(b"one", 100).unwrap();
        }
        let store = QueueStore::open(dir.path()).unwrap();
        assert_eq!(store.append(b"two", 200).unwrap(), 2);
        assert_eq!(store.get(1).unwrap().as_deref(), Some(&b"one"[..]));
    }

    #[test]
    fn next_key_skips_swept_gaps() {
        let (_dir, store) = open_store();
        store.append(b"a", 10).unwrap();
        store.append(b"b", 1_000).unwrap();
        store.append(b"c", 20).unwrap();
        // Drops keys 1 and 3 (stale), keeps key 2.
        assert_eq!(store.sweep_expired(500).unwrap(), 2);
        assert_eq!(store.next_key(0).unwrap(), Some(2));
        assert_eq!(store.next_key(2).unwrap(), None);
    }

    #[test]
    fn bookmarks_round_trip_and_advance_over_sweeps() {
        let (_dir, store) = open_store();
        for i in 0..5 {
            store.append(format!("p{i}").as_bytes(), 10 * (i + 1)).unwrap();
        }
        store.write_bookmark("writer", 1).unwrap();

        // Keys 1..=3 expire; the bookmark moves to just before key 4.
        store.sweep_expired(35).unwrap();
        assert_eq!(store.read_bookmark("writer").unwrap(), Some(3));

        // Everything expires; the bookmark lands on the last allocated key.
        store.sweep_expired(1_000).unwrap();
        assert_eq!(store.read_bookmark("writer").unwrap(), Some(5));
    }

    #[test]
    fn bookmark_never_skips_a_live_entry() {
        let (_dir, store) = open_store();
        store.append(b"a", 10).unwrap();
        store.append(b"b", 1_000).unwrap();
        store.append(b"c", 20).unwrap();
        store.write_bookmark("writer", 0).unwrap();
        // Keys 1 and 3 expire, key 2 stays: the bookmark must stop at 1.
        store.sweep_expired(500).unwrap();
        assert_eq!(store.read_bookmark("writer").unwrap(), Some(1));
    }

    #[test]
    fn drop_oldest_until_enforces_the_byte_budget() {
        let (_dir, store) = open_store();
        for i in 0..10 {
            store.append(&[0u8; 100], i).unwrap();
        }
        assert_eq!(store.total_bytes().unwrap(), 1_000);
        let dropped = store.drop_oldest_until(450).unwrap();
        assert_eq!(dropped, 6);
        assert_eq!(store.total_bytes().unwrap(), 400);
        assert_eq!(store.oldest_key().unwrap(), Some(7));
    }
}
