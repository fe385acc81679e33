//! In-memory state backend implementation
//!
//! A DashMap-backed [`StateBackend`] used for snapshots when no snapshot
//! directory is configured, and in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use super::backend::StateBackend;
use crate::error::StateResult;

/// In-memory state backend using DashMap
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    data: Arc<DashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "memory put");
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> StateResult<()> {
        self.data.clear();
        Ok(())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::tests::*;

    #[tokio::test]
    async fn test_memory_backend_basic() {
        test_backend_basic_ops(MemoryStateBackend::new()).await;
    }

    #[tokio::test]
    async fn test_memory_backend_list_keys() {
        test_backend_list_keys(MemoryStateBackend::new()).await;
    }

    #[tokio::test]
    async fn test_memory_backend_clear() {
        test_backend_clear(MemoryStateBackend::new()).await;
    }

    #[tokio::test]
    async fn test_memory_backend_contains() {
        test_backend_contains(MemoryStateBackend::new()).await;
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let backend = MemoryStateBackend::new();
        let clone = backend.clone();
        backend.put(b"k", b"v").await.unwrap();
        assert!(clone.contains(b"k").await.unwrap());
    }
}
