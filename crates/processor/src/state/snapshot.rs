//! Local table snapshots
//!
//! A snapshot holds the encoded entries of one table partition together with
//! the changelog offset it covers. Recovery loads it and replays only the
//! changelog records written after that offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::backend::StateBackend;
use crate::error::{StateError, StateResult};

/// Point-in-time copy of a table partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// First changelog offset not reflected in `entries`
    pub next_offset: i64,
    /// Keys with their encoded values
    pub entries: Vec<(String, Vec<u8>)>,
    pub taken_at: DateTime<Utc>,
}

/// Stores snapshots under `snapshot/<group>/<partition>` in a [`StateBackend`]
#[derive(Clone)]
pub struct SnapshotStore {
    backend: Arc<dyn StateBackend>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub fn key(group: &str, partition: u32) -> Vec<u8> {
        format!("snapshot/{}/{}", group, partition).into_bytes()
    }

    pub async fn save(&self, group: &str, partition: u32, snapshot: &Snapshot) -> StateResult<()> {
        let bytes = bincode::serialize(snapshot).map_err(|e| StateError::SnapshotFailed {
            group: group.to_string(),
            partition,
            reason: e.to_string(),
        })?;
        self.backend
            .put(&Self::key(group, partition), &bytes)
            .await?;
        debug!(
            group,
            partition,
            next_offset = snapshot.next_offset,
            entries = snapshot.entries.len(),
            "saved table snapshot"
        );
        Ok(())
    }

    pub async fn load(&self, group: &str, partition: u32) -> StateResult<Option<Snapshot>> {
        let Some(bytes) = self.backend.get(&Self::key(group, partition)).await? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StateError::RestoreFailed {
                group: group.to_string(),
                partition,
                reason: e.to_string(),
            })
    }

    pub async fn remove(&self, group: &str, partition: u32) -> StateResult<()> {
        self.backend.delete(&Self::key(group, partition)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateBackend;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = SnapshotStore::new(Arc::new(MemoryStateBackend::new()));
        assert!(store.load("g", 0).await.unwrap().is_none());

        let snapshot = Snapshot {
            next_offset: 42,
            entries: vec![("a".to_string(), vec![1]), ("b".to_string(), vec![0])],
            taken_at: Utc::now(),
        };
        store.save("g", 0, &snapshot).await.unwrap();

        assert_eq!(store.load("g", 0).await.unwrap(), Some(snapshot));
        assert!(store.load("g", 1).await.unwrap().is_none());

        store.remove("g", 0).await.unwrap();
        assert!(store.load("g", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let backend = Arc::new(MemoryStateBackend::new());
        backend.put(&SnapshotStore::key("g", 0), b"\x01").await.unwrap();

        let store = SnapshotStore::new(backend);
        let err = store.load("g", 0).await.unwrap_err();
        assert!(matches!(err, StateError::RestoreFailed { .. }));
    }
}
