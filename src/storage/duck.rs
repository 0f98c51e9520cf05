use super::KvStore;
use crate::error::StorageError;
use chrono::Utc;
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key         VARCHAR PRIMARY KEY,
    value       VARCHAR NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS crawl_run_ids START 1;

CREATE TABLE IF NOT EXISTS crawl_runs (
    id          INTEGER PRIMARY KEY DEFAULT nextval('crawl_run_ids'),
    finished_at TIMESTAMP NOT NULL,
    status      VARCHAR NOT NULL,
    new_slots   INTEGER DEFAULT 0,
    error_msg   VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    pub fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running migrations…");
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute_batch(DDL)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    #[cfg(test)]
    pub fn run_count(&self) -> Result<i64, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM crawl_runs")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }
}

impl KvStore for DuckDbStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn.prepare("SELECT value FROM kv_store WHERE key = ?")?;
        match stmt.query_row(params![key], |r| r.get::<_, String>(0)) {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert inside a transaction so readers never see a half-written row.
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            r#"INSERT INTO kv_store (key, value, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at"#,
            params![key, value, Utc::now().naive_utc()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_run(&self, new_slots: usize, error: Option<&str>) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            "INSERT INTO crawl_runs (finished_at, status, new_slots, error_msg) VALUES (?, ?, ?, ?)",
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                new_slots as i64,
                error,
            ],
        )?;
        Ok(())
    }
}
