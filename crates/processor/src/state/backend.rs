//! State backend trait definition
//!
//! `StateBackend` is the byte-oriented key/value interface used for local
//! state that lives next to a processing group, such as table snapshots.
//! The changelog topic remains the source of truth; a backend only shortens
//! recovery.

use async_trait::async_trait;

use crate::error::StateResult;

/// Core trait for local state storage
///
/// ## Implementation Requirements
///
/// - **Thread safety**: Concurrent access from multiple partition workers
/// - **Atomicity**: Individual operations are atomic
/// - **Durability** (optional): Persistent backends should flush writes
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Retrieve a value for the given key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - Value found
    /// * `Ok(None)` - Key not found
    /// * `Err(StateError)` - Backend error occurred
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Store a value for the given key, overwriting any previous value
    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Delete a key; deleting a missing key is not an error
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// List all keys with the given prefix. An empty prefix matches all keys.
    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>>;

    /// Clear all state from the backend
    async fn clear(&self) -> StateResult<()> {
        let keys = self.list_keys(b"").await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Number of keys in the backend
    async fn count(&self) -> StateResult<usize> {
        Ok(self.list_keys(b"").await?.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn snapshot_key(partition: u32) -> Vec<u8> {
        format!("snapshot/group/{}", partition).into_bytes()
    }

    // Behaviour every StateBackend implementation must share
    pub async fn test_backend_basic_ops<B: StateBackend>(backend: B) {
        backend.put(&snapshot_key(1), b"value1").await.unwrap();
        let value = backend.get(&snapshot_key(1)).await.unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        let value = backend.get(&snapshot_key(999)).await.unwrap();
        assert_eq!(value, None);

        backend.put(&snapshot_key(1), b"new_value").await.unwrap();
        let value = backend.get(&snapshot_key(1)).await.unwrap();
        assert_eq!(value, Some(b"new_value".to_vec()));

        backend.delete(&snapshot_key(1)).await.unwrap();
        let value = backend.get(&snapshot_key(1)).await.unwrap();
        assert_eq!(value, None);

        backend.delete(&snapshot_key(999)).await.unwrap();
    }

    pub async fn test_backend_list_keys<B: StateBackend>(backend: B) {
        backend.clear().await.unwrap();

        backend.put(b"snapshot/a/0", b"a0").await.unwrap();
        backend.put(b"snapshot/a/1", b"a1").await.unwrap();
        backend.put(b"snapshot/a/2", b"a2").await.unwrap();
        backend.put(b"snapshot/b/0", b"b0").await.unwrap();
        backend.put(b"meta", b"m").await.unwrap();

        assert_eq!(backend.list_keys(b"snapshot/a/").await.unwrap().len(), 3);
        assert_eq!(backend.list_keys(b"snapshot/").await.unwrap().len(), 4);
        assert_eq!(backend.list_keys(b"").await.unwrap().len(), 5);
    }

    pub async fn test_backend_clear<B: StateBackend>(backend: B) {
        backend.put(b"key1", b"val1").await.unwrap();
        backend.put(b"key2", b"val2").await.unwrap();
        backend.put(b"key3", b"val3").await.unwrap();

        assert_eq!(backend.count().await.unwrap(), 3);

        backend.clear().await.unwrap();

        assert_eq!(backend.count().await.unwrap(), 0);
    }

    pub async fn test_backend_contains<B: StateBackend>(backend: B) {
        backend.clear().await.unwrap();

        assert!(!backend.contains(b"test").await.unwrap());
        backend.put(b"test", b"value").await.unwrap();
        assert!(backend.contains(b"test").await.unwrap());
        backend.delete(b"test").await.unwrap();
        assert!(!backend.contains(b"test").await.unwrap());
    }
}
