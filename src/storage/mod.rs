//! Key-value persistence for seen-set, baselines, alerts and the last snapshot.
//!
//! Every backend replaces a key's value as a whole; a concurrent reader sees
//! either the old or the new value, never a partial write.

mod duck;
mod json_file;
mod lock;

pub use duck::DuckDbStore;
pub use json_file::JsonFileStore;
pub use lock::FileLock;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, warn};

pub const KEY_SEEN: &str = "last_slots";
pub const KEY_BASELINES: &str = "baselines";
pub const KEY_ALARMS: &str = "alarms";
pub const KEY_SNAPSHOT: &str = "snapshot";

const RUN_LOCK_FILE: &str = "refresh.lock";
const STATE_LOCK_FILE: &str = "state.lock";

// ── Backend trait ─────────────────────────────────────────────────────────────

pub trait KvStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Record the outcome of one refresh; backends without a run log ignore it.
    fn record_run(&self, _new_slots: usize, _error: Option<&str>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-process backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl KvStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.backend {
        StorageBackend::Json => Arc::new(
            JsonFileStore::open(&config.data_dir)
                .with_context(|| format!("Failed to open data dir {:?}", config.data_dir))?,
        ),
        StorageBackend::Duckdb => {
            let db = DuckDbStore::open(&config.db_path)
                .with_context(|| format!("Failed to open DuckDB at {:?}", config.db_path))?;
            if config.run_migrations {
                db.run_migrations()?;
            }
            Arc::new(db)
        }
        StorageBackend::Memory => Arc::new(MemoryStore::default()),
    };
    Ok(store)
}

/// Backend from `config`, locked through `data_dir` unless it lives in memory.
pub fn open_state(config: &StorageConfig) -> Result<StateStore> {
    let store = StateStore::new(open_backend(config)?);
    Ok(match config.backend {
        StorageBackend::Memory => store,
        _ => store.with_lock_dir(&config.data_dir),
    })
}

// ── Typed state store ─────────────────────────────────────────────────────────

/// Held for one read-modify-write cycle on shared state.
pub struct StateGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: Option<FileLock>,
}

/// Outcome of [`StateStore::try_lock_run`].
#[derive(Debug)]
pub enum RunLock {
    /// No other refresh runs; the file lock (if any) is held until dropped.
    Acquired(Option<FileLock>),
    /// Another process holds the refresh lock.
    Busy,
}

/// Typed JSON view over a [`KvStore`], plus the write lock that serialises
/// read-modify-write cycles on shared state. With a lock directory the
/// serialisation also spans processes.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvStore>,
    write_lock: Arc<AsyncMutex<()>>,
    lock_dir: Option<PathBuf>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(AsyncMutex::new(())),
            lock_dir: None,
        }
    }

    /// Lock files are created in `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// Hold for the whole load → modify → save of seen-set, baselines or alarms.
    /// An unusable lock file degrades to the in-process lock with a warning.
    pub async fn exclusive(&self) -> StateGuard<'_> {
        let local = self.write_lock.lock().await;
        let file = match &self.lock_dir {
            Some(dir) => match FileLock::acquire(&dir.join(STATE_LOCK_FILE)).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    warn!(error = %e, "state lock file unusable, locking in-process only");
                    None
                }
            },
            None => None,
        };
        StateGuard { _local: local, _file: file }
    }

    /// Non-blocking claim on the refresh slot shared by every process using
    /// this lock directory.
    pub fn try_lock_run(&self) -> RunLock {
        let Some(dir) = &self.lock_dir else {
            return RunLock::Acquired(None);
        };
        match FileLock::try_acquire(&dir.join(RUN_LOCK_FILE)) {
            Ok(Some(lock)) => RunLock::Acquired(Some(lock)),
            Ok(None) => RunLock::Busy,
            Err(e) => {
                warn!(error = %e, "refresh lock file unusable, locking in-process only");
                RunLock::Acquired(None)
            }
        }
    }

    /// Missing or unreadable values degrade to `T::default()`.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.try_load(key) {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!(key, "no stored value, using default");
                T::default()
            }
            Err(e) => {
                warn!(key, error = %e, "failed to load state, using default");
                T::default()
            }
        }
    }

    pub fn try_load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.backend.load(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Serde { key: key.to_string(), source })
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string_pretty(value)
            .map_err(|source| StorageError::Serde { key: key.to_string(), source })?;
        self.backend.save(key, &raw)
    }

    pub fn record_run(&self, new_slots: usize, error: Option<&str>) {
        if let Err(e) = self.backend.record_run(new_slots, error) {
            warn!(error = %e, "failed to record crawl run");
        }
    }
}
