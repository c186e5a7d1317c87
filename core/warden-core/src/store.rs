//! SQLite-backed key/value store shared by every Warden process.
//!
//! One table, `keystore(key TEXT PRIMARY KEY, value TEXT)`. Writes are an
//! insert-or-ignore followed by an update that only fires when the insert did
//! not, executed inside one transaction while holding an exclusive advisory
//! lock on a sidecar file. The lock spans OS processes, not just threads:
//! workers are independent processes and each opens its own connection.
//!
//! `inc` is a read-modify-write against a caller-supplied current value, not
//! a transactional increment. Concurrent incrementers of the same key from
//! different processes can lose updates; callers keep the authoritative
//! counter in process memory and treat the store as a reporting mirror.

use fs2::FileExt;
use fs_err as fs;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

const DB_FILE: &str = "warden.db";
const LOCK_FILE: &str = "warden.db.lock";

const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS keystore (key TEXT PRIMARY KEY, value TEXT)";
const INSERT_STATEMENT: &str = "INSERT OR IGNORE INTO keystore (key, value) VALUES (?1, ?2)";
const UPDATE_STATEMENT: &str = "UPDATE keystore SET value = ?2 WHERE changes() = 0 AND key = ?1";
const SELECT_STATEMENT: &str = "SELECT value FROM keystore WHERE key = ?1";
const SELECT_ALL: &str = "SELECT key, value FROM keystore";

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    lock_path: PathBuf,
}

impl Store {
    /// Opens the store under `dir`, creating the directory and the table if
    /// absent. Safe to race from multiple first-launched processes.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|err| WardenError::io("failed to create storage directory", err))?;

        let store = Self {
            db_path: dir.join(DB_FILE),
            lock_path: dir.join(LOCK_FILE),
        };
        store.with_connection(|conn| {
            conn.execute(CREATE_TABLE, [])
                .map_err(|err| WardenError::store("failed to initialize keystore", err))?;
            Ok(())
        })?;

        Ok(store)
    }

    /// Inserts or updates a value. Numeric values pass through `Display`, so
    /// they are stored in their string form and read back with `get_i64` /
    /// `get_f64`.
    pub fn put(&self, key: &str, value: impl Display) -> Result<()> {
        self.upsert(key, &value.to_string())
    }

    /// Mirrors `current + delta` for `key` and returns the new value. The
    /// caller's `current` is the source of truth; see the module docs for the
    /// cross-process caveat.
    pub fn inc(&self, key: &str, delta: i64, current: i64) -> Result<i64> {
        let next = current + delta;
        self.upsert(key, &next.to_string())?;
        Ok(next)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(SELECT_STATEMENT, params![key], |row| row.get::<_, String>(0))
                .optional()
                .map_err(|err| WardenError::store("failed to query key", err))
        })
    }

    /// Returns the value parsed as an integer, or 0 when absent or
    /// unparsable.
    pub fn get_i64(&self, key: &str) -> Result<i64> {
        Ok(self
            .get(key)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// Returns the value parsed as a float, or 0.0 when absent or unparsable.
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        Ok(self
            .get(key)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.0))
    }

    pub fn get_all(&self) -> Result<Vec<(String, String)>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(SELECT_ALL)
                .map_err(|err| WardenError::store("failed to prepare keystore query", err))?;

            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|err| WardenError::store("failed to read keystore rows", err))?;

            let mut entries = Vec::new();
            for row in rows {
                entries
                    .push(row.map_err(|err| WardenError::store("failed to decode keystore row", err))?);
            }
            Ok(entries)
        })
    }

    fn upsert(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock()?;
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| WardenError::store("failed to begin upsert", err))?;
            tx.execute(INSERT_STATEMENT, params![key, value])
                .map_err(|err| WardenError::store("failed to insert key", err))?;
            tx.execute(UPDATE_STATEMENT, params![key, value])
                .map_err(|err| WardenError::store("failed to update key", err))?;
            tx.commit()
                .map_err(|err| WardenError::store("failed to commit upsert", err))
        })
    }

    /// Takes the cross-process exclusive lock; released when the returned
    /// handle drops.
    fn write_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| WardenError::io("failed to open store lock file", err))?;
        file.lock_exclusive()
            .map_err(|err| WardenError::io("failed to acquire store lock", err))?;
        Ok(file)
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = Connection::open(&self.db_path)
            .map_err(|err| WardenError::store("failed to open keystore db", err))?;
        op(&mut conn)
    }
}
