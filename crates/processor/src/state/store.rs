//! Keyed state store backed by a changelog topic
//!
//! [`KeyedStore`] describes a group's table (changelog topic, codec,
//! snapshot settings) and hands out one [`PartitionStore`] per owned
//! partition. A partition store is exclusively owned by the worker that
//! holds the partition.
//!
//! Writes go to the changelog first and are applied in memory only once the
//! broker acknowledged them, so a failed append leaves the table untouched.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::changelog::Changelog;
use super::snapshot::{Snapshot, SnapshotStore};
use crate::broker::{Broker, Record};
use crate::codec::Codec;
use crate::error::{StateError, StateResult};

/// Outcome of a partition recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Whether a snapshot was loaded before replaying
    pub from_snapshot: bool,
    /// Changelog records replayed
    pub replayed: u64,
    /// Keys in the table afterwards
    pub keys: usize,
    /// Changelog offset the table is current up to
    pub next_offset: i64,
}

/// A group's table: changelog topic plus value codec
pub struct KeyedStore<V> {
    group: String,
    changelog: Changelog,
    codec: Arc<dyn Codec<V>>,
    snapshots: Option<SnapshotStore>,
    snapshot_interval: u64,
}

impl<V> Clone for KeyedStore<V> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            changelog: self.changelog.clone(),
            codec: Arc::clone(&self.codec),
            snapshots: self.snapshots.clone(),
            snapshot_interval: self.snapshot_interval,
        }
    }
}

impl<V: Clone + Send + 'static> KeyedStore<V> {
    pub fn new(broker: Arc<dyn Broker>, group: &str, codec: Arc<dyn Codec<V>>) -> Self {
        Self {
            group: group.to_string(),
            changelog: Changelog::new(broker, group),
            codec,
            snapshots: None,
            snapshot_interval: 0,
        }
    }

    /// Snapshot every `interval` writes into `snapshots`; 0 disables snapshots
    pub fn with_snapshots(mut self, snapshots: SnapshotStore, interval: u64) -> Self {
        self.snapshots = Some(snapshots);
        self.snapshot_interval = interval;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        self.changelog.topic()
    }

    /// Store for one partition; it recovers lazily on first access
    pub fn open_partition(&self, partition: u32) -> PartitionStore<V> {
        PartitionStore {
            group: self.group.clone(),
            partition,
            changelog: self.changelog.clone(),
            codec: Arc::clone(&self.codec),
            snapshots: self.snapshots.clone(),
            snapshot_interval: self.snapshot_interval,
            table: HashMap::new(),
            next_offset: 0,
            recovered: false,
            writes_since_snapshot: 0,
        }
    }
}

/// One partition of a table
pub struct PartitionStore<V> {
    group: String,
    partition: u32,
    changelog: Changelog,
    codec: Arc<dyn Codec<V>>,
    snapshots: Option<SnapshotStore>,
    snapshot_interval: u64,
    table: HashMap<String, V>,
    next_offset: i64,
    recovered: bool,
    writes_since_snapshot: u64,
}

impl<V: Clone + Send + 'static> PartitionStore<V> {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Changelog offset the in-memory table is current up to
    pub fn changelog_offset(&self) -> i64 {
        self.next_offset
    }

    /// Rebuild the table from the latest snapshot (if any) and the changelog.
    ///
    /// The table is reset first, so recovering twice yields the same state
    /// as recovering once.
    pub async fn recover(&mut self) -> StateResult<RecoveryStats> {
        self.table.clear();
        self.next_offset = 0;
        self.recovered = false;

        let mut stats = RecoveryStats::default();

        if let Some(snapshots) = &self.snapshots {
            match snapshots.load(&self.group, self.partition).await {
                Ok(Some(snapshot)) => match self.restore(snapshot) {
                    Ok(()) => stats.from_snapshot = true,
                    Err(e) => {
                        warn!(group = %self.group, partition = self.partition, error = %e, "discarding unusable snapshot");
                        self.table.clear();
                        self.next_offset = 0;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(group = %self.group, partition = self.partition, error = %e, "snapshot load failed, replaying full changelog");
                }
            }
        }

        let codec = Arc::clone(&self.codec);
        let table = &mut self.table;
        let mut replayed = 0u64;
        let next = self
            .changelog
            .replay(self.partition, self.next_offset, |record| {
                replayed += 1;
                apply_record(table, codec.as_ref(), record);
            })
            .await
            .map_err(|e| StateError::RecoveryFailed {
                topic: self.changelog.topic().to_string(),
                partition: self.partition,
                reason: e.to_string(),
            })?;

        self.next_offset = next;
        self.recovered = true;
        self.writes_since_snapshot = 0;

        stats.replayed = replayed;
        stats.keys = self.table.len();
        stats.next_offset = next;

        info!(
            group = %self.group,
            partition = self.partition,
            from_snapshot = stats.from_snapshot,
            replayed = stats.replayed,
            keys = stats.keys,
            "table partition recovered"
        );
        Ok(stats)
    }

    fn restore(&mut self, snapshot: Snapshot) -> StateResult<()> {
        for (key, bytes) in snapshot.entries {
            let value = self
                .codec
                .decode(&bytes)
                .map_err(|e| StateError::RestoreFailed {
                    group: self.group.clone(),
                    partition: self.partition,
                    reason: format!("key '{}': {}", key, e),
                })?;
            self.table.insert(key, value);
        }
        self.next_offset = snapshot.next_offset;
        Ok(())
    }

    async fn ensure_recovered(&mut self) -> StateResult<()> {
        if !self.recovered {
            self.recover().await?;
        }
        Ok(())
    }

    /// Current value of `key`, recovering the partition first if needed
    pub async fn get(&mut self, key: &str) -> StateResult<Option<&V>> {
        self.ensure_recovered().await?;
        Ok(self.table.get(key))
    }

    /// Current value of `key`, or the type's empty value when absent
    pub async fn get_or_default(&mut self, key: &str) -> StateResult<V>
    where
        V: Default,
    {
        Ok(self.get(key).await?.cloned().unwrap_or_default())
    }

    /// Current value of an already recovered partition
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.table.get(key)
    }

    /// Append `value` to the changelog, then apply it to the table
    pub async fn set(&mut self, key: &str, value: V) -> StateResult<()> {
        let bytes = self
            .codec
            .encode(&value)
            .map_err(|e| StateError::SerializationFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if bytes.is_empty() {
            return Err(StateError::EmptyEncoding {
                key: key.to_string(),
            });
        }

        self.ensure_recovered().await?;
        let offset = self.append(key, &bytes).await?;

        self.table.insert(key.to_string(), value);
        self.after_write(offset).await;
        Ok(())
    }

    /// Append a tombstone for `key`, then remove it from the table
    pub async fn delete(&mut self, key: &str) -> StateResult<()> {
        self.ensure_recovered().await?;
        let offset = self.append(key, &[]).await?;

        self.table.remove(key);
        self.after_write(offset).await;
        Ok(())
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> StateResult<i64> {
        self.changelog
            .append(self.partition, key, bytes)
            .await
            .map_err(|source| StateError::ChangelogWrite {
                topic: self.changelog.topic().to_string(),
                partition: self.partition,
                source,
            })
    }

    async fn after_write(&mut self, offset: i64) {
        self.next_offset = self.next_offset.max(offset + 1);
        self.writes_since_snapshot += 1;

        if self.snapshot_interval > 0 && self.writes_since_snapshot >= self.snapshot_interval {
            if let Err(e) = self.snapshot().await {
                warn!(group = %self.group, partition = self.partition, error = %e, "snapshot failed");
            }
        }
    }

    /// Write a snapshot of the current table
    pub async fn snapshot(&mut self) -> StateResult<()> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(());
        };

        let mut entries = Vec::with_capacity(self.table.len());
        for (key, value) in &self.table {
            let bytes = self
                .codec
                .encode(value)
                .map_err(|e| StateError::SerializationFailed {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            entries.push((key.clone(), bytes));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshot = Snapshot {
            next_offset: self.next_offset,
            entries,
            taken_at: Utc::now(),
        };
        snapshots.save(&self.group, self.partition, &snapshot).await?;
        self.writes_since_snapshot = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Keys currently in the table, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.table.iter()
    }
}

/// Last-write-wins application of a changelog record; empty payloads delete
pub(crate) fn apply_record<V: 'static>(table: &mut HashMap<String, V>, codec: &dyn Codec<V>, record: Record) {
    if record.payload.is_empty() {
        table.remove(&record.key);
        return;
    }
    match codec.decode(&record.payload) {
        Ok(value) => {
            table.insert(record.key, value);
        }
        Err(e) => {
            debug!(topic = %record.topic, partition = record.partition, offset = record.offset, error = %e, "skipping undecodable changelog record");
        }
    }
}
