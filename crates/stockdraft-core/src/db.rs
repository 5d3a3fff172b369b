// SQLite persistence layer: a durable key-value store that survives reloads.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// SQLite-backed key-value storage. Values are stored as opaque text so a
/// corrupt entry can be read back and handled by the caller.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure the schema
    /// exists. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![key, value],
        )
        .with_context(|| format!("failed to store key {key}"))?;
        Ok(())
    }

    /// Read the raw value stored under `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read key {key}"))
    }

    /// Delete `key`. Returns `true` if a row was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .with_context(|| format!("failed to remove key {key}"))?;
        Ok(removed > 0)
    }

    /// Delete every key starting with `prefix` in one transaction. Returns the
    /// number of rows removed.
    ///
    /// Uses `substr` rather than `LIKE` because key prefixes contain `_`,
    /// which `LIKE` treats as a wildcard.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let removed = tx
            .execute(
                "DELETE FROM kv_store WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )
            .with_context(|| format!("failed to remove keys with prefix {prefix}"))?;
        tx.commit().context("failed to commit prefix removal")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    #[test]
    fn open_creates_table() {
        let db = test_db();
        let conn = db.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"kv_store".to_string()));
    }

    #[test]
    fn put_get_and_overwrite() {
        let db = test_db();
        assert_eq!(db.get("token").unwrap(), None);

        db.put("token", "abc").unwrap();
        assert_eq!(db.get("token").unwrap().as_deref(), Some("abc"));

        db.put("token", "def").unwrap();
        assert_eq!(db.get("token").unwrap().as_deref(), Some("def"));
    }

    #[test]
    fn remove_reports_whether_row_existed() {
        let db = test_db();
        db.put("k", "v").unwrap();
        assert!(db.remove("k").unwrap());
        assert!(!db.remove("k").unwrap());
        assert_eq!(db.get("k").unwrap(), None);
    }

    #[test]
    fn prefix_matching_treats_underscore_literally() {
        let db = test_db();
        db.put("draftPicks_1", "[]").unwrap();
        db.put("draftPicks_2", "[]").unwrap();
        // Would match `draftPicks_%` under LIKE because `_` is a wildcard.
        db.put("draftPicksX1", "[]").unwrap();
        db.put("selectedLeague", "{}").unwrap();

        assert_eq!(db.remove_prefix("draftPicks_").unwrap(), 2);
        assert_eq!(db.get("draftPicks_1").unwrap(), None);
        assert_eq!(db.get("draftPicks_2").unwrap(), None);
        assert!(db.get("draftPicksX1").unwrap().is_some());
        assert!(db.get("selectedLeague").unwrap().is_some());
    }

    #[test]
    fn data_survives_reopen_of_file_database() {
        let dir = std::env::temp_dir().join(format!(
            "stockdraft-db-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("cache.db");
        let path_str = path.to_string_lossy().into_owned();

        {
            let db = Database::open(&path_str).unwrap();
            db.put("draftPicks_5", "[1]").unwrap();
        }
        let db = Database::open(&path_str).unwrap();
        assert_eq!(db.get("draftPicks_5").unwrap().as_deref(), Some("[1]"));

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
