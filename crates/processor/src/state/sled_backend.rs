//! Sled-based persistent state backend
//!
//! Durable [`StateBackend`] used for table snapshots when a snapshot
//! directory is configured, so that a restarted worker only replays the
//! changelog tail written after its last snapshot.

use async_trait::async_trait;
use sled::Db;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace};

use super::backend::StateBackend;
use crate::error::{StateError, StateResult};

/// Configuration for the Sled backend
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Cache size in bytes (default: 64MB)
    pub cache_capacity: u64,
    /// Flush every N writes (default: 1, i.e. every snapshot is flushed)
    pub flush_every: u64,
}

impl SledConfig {
    /// Create a configuration for the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_capacity: 64 * 1024 * 1024,
            flush_every: 1,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_flush_every(mut self, count: u64) -> Self {
        self.flush_every = count.max(1);
        self
    }
}

fn storage_error(details: impl Into<String>) -> StateError {
    StateError::StorageError {
        backend_type: "sled".to_string(),
        details: details.into(),
    }
}

/// Persistent state backend using Sled
pub struct SledStateBackend {
    db: Db,
    config: SledConfig,
    writes: AtomicU64,
}

impl SledStateBackend {
    /// Open a Sled database with the given configuration
    ///
    /// # Returns
    ///
    /// * `Ok(SledStateBackend)` - Successfully opened database
    /// * `Err(StateError)` - Failed to create the directory or open the database
    pub async fn open(config: SledConfig) -> StateResult<Self> {
        info!(path = ?config.path, "opening sled snapshot store");

        tokio::fs::create_dir_all(&config.path)
            .await
            .map_err(|e| storage_error(format!("Failed to create directory: {}", e)))?;

        let sled_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity);
        let db = tokio::task::spawn_blocking(move || sled_config.open())
            .await
            .map_err(|e| storage_error(format!("Open task failed: {}", e)))?
            .map_err(|e| storage_error(format!("Failed to open database: {}", e)))?;

        info!(keys = db.len(), "sled snapshot store opened");

        Ok(Self {
            db,
            config,
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush all pending writes to disk, returning the number of bytes flushed
    pub async fn flush(&self) -> StateResult<usize> {
        let db = self.db.clone();
        let flushed = self
            .blocking(move || db.flush().map_err(|e| storage_error(format!("Flush failed: {}", e))))
            .await?;
        debug!(bytes = flushed, "flushed sled snapshot store");
        Ok(flushed)
    }

    async fn maybe_flush(&self) -> StateResult<()> {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.config.flush_every == 0 {
            self.flush().await?;
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StateResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| storage_error(format!("Blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl StateBackend for SledStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!(key_len = key.len(), "sled get");
        let db = self.db.clone();
        let key = key.to_vec();
        self.blocking(move || {
            db.get(key)
                .map(|value| value.map(|v| v.to_vec()))
                .map_err(|e| storage_error(format!("Get failed: {}", e)))
        })
        .await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "sled put");
        let db = self.db.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        self.blocking(move || {
            db.insert(key, value)
                .map(|_| ())
                .map_err(|e| storage_error(format!("Put failed: {}", e)))
        })
        .await?;
        self.maybe_flush().await
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        self.blocking(move || {
            db.remove(key)
                .map(|_| ())
                .map_err(|e| storage_error(format!("Delete failed: {}", e)))
        })
        .await?;
        self.maybe_flush().await
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        let db = self.db.clone();
        let prefix = prefix.to_vec();
        self.blocking(move || {
            db.scan_prefix(prefix)
                .keys()
                .map(|result| {
                    result
                        .map(|k| k.to_vec())
                        .map_err(|e| storage_error(format!("Prefix scan failed: {}", e)))
                })
                .collect()
        })
        .await
    }

    async fn clear(&self) -> StateResult<()> {
        let db = self.db.clone();
        self.blocking(move || db.clear().map_err(|e| storage_error(format!("Clear failed: {}", e))))
            .await?;
        self.flush().await.map(|_| ())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.db.len())
    }
}

impl Drop for SledStateBackend {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush sled database on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::tests::*;
    use tempfile::TempDir;

    async fn create_test_backend(dir: &TempDir) -> SledStateBackend {
        SledStateBackend::open(SledConfig::new(dir.path().join("db")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sled_backend_basic() {
        let dir = TempDir::new().unwrap();
        test_backend_basic_ops(create_test_backend(&dir).await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_list_keys() {
        let dir = TempDir::new().unwrap();
        test_backend_list_keys(create_test_backend(&dir).await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_clear() {
        let dir = TempDir::new().unwrap();
        test_backend_clear(create_test_backend(&dir).await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_contains() {
        let dir = TempDir::new().unwrap();
        test_backend_contains(create_test_backend(&dir).await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = create_test_backend(&dir).await;
            backend.put(b"snapshot/g/0", b"data").await.unwrap();
        }

        let backend = create_test_backend(&dir).await;
        assert_eq!(
            backend.get(b"snapshot/g/0").await.unwrap(),
            Some(b"data".to_vec())
        );
    }
}
