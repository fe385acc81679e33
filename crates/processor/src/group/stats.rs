//! Processing-group counters

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all partition workers of one processor
#[derive(Debug, Default)]
pub struct ProcessorStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    decode_errors: AtomicU64,
    state_writes: AtomicU64,
    emitted: AtomicU64,
    commits: AtomicU64,
    recoveries: AtomicU64,
    dead_lettered: AtomicU64,
    committed: DashMap<(String, u32), i64>,
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    /// Events whose effects were fully applied
    pub processed: u64,
    /// Events skipped after a decode or handler failure
    pub skipped: u64,
    /// Events that stopped a partition
    pub failed: u64,
    pub decode_errors: u64,
    pub state_writes: u64,
    pub emitted: u64,
    pub commits: u64,
    pub recoveries: u64,
    pub dead_lettered: u64,
    /// Last committed offset per (topic, partition)
    pub committed: BTreeMap<(String, u32), i64>,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_state_write(&self) {
        self.state_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, topic: &str, partition: u32, next_offset: i64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.committed
            .insert((topic.to_string(), partition), next_offset);
    }

    /// Last offset committed by this processor for a topic partition
    pub fn committed(&self, topic: &str, partition: u32) -> Option<i64> {
        self.committed
            .get(&(topic.to_string(), partition))
            .map(|entry| *entry.value())
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            state_writes: self.state_writes.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            committed: self
                .committed
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = ProcessorStats::new();
        stats.record_processed();
        stats.record_processed();
        stats.record_skipped();
        stats.record_commit("in", 1, 7);
        stats.record_commit("in", 1, 9);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.commits, 2);
        assert_eq!(snapshot.committed.get(&("in".to_string(), 1)), Some(&9));
        assert_eq!(stats.committed("in", 1), Some(9));
        assert_eq!(stats.committed("in", 0), None);
    }
}
