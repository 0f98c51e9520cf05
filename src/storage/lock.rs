use crate::error::StorageError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

const RETRY_EVERY: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on a file, visible to every process that uses the
/// same data directory. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> Result<File, StorageError> {
        let io_err = |source| StorageError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)
    }

    /// `Ok(None)` while another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StorageError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(StorageError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Waits until the lock is free.
    pub async fn acquire(path: &Path) -> Result<Self, StorageError> {
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            sleep(RETRY_EVERY).await;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refresh.lock");

        let held = FileLock::try_acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        let held = FileLock::try_acquire(&path).unwrap().unwrap();

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { FileLock::acquire(&path).await.map(|_| ()) })
        };
        sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
