//! Partitioned-log broker boundary
//!
//! The processing core only needs a small slice of what a log broker offers:
//!
//! - **Topics**: named, partitioned, append-only logs of key/value records
//! - **Produce/fetch**: acknowledged appends and ordered per-partition reads
//! - **Offsets**: explicit per-group commits (auto-commit is never used)
//! - **Groups**: membership with partition assignment and ownership fencing
//!
//! [`MemoryBroker`] implements all of it in-process. `KafkaBroker` (behind
//! the `kafka` feature) maps it onto an Apache Kafka cluster.

pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

pub use error::{BrokerError, BrokerResult};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::MemoryBroker;
pub use retry::RetryPolicy;

/// A record read from a topic partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: String,
    /// Raw payload; an empty payload on a table topic is a tombstone
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Partitions handed to one group member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Bumped on every membership change
    pub generation: u64,
    /// Owned partition numbers, ascending
    pub partitions: Vec<u32>,
}

/// Operations the processing core needs from a partitioned log.
///
/// All offsets are "next offset" style: `high_watermark` is the offset the
/// next append will receive, and `commit` stores the next offset to read.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create a topic; creating an existing topic is a no-op
    async fn create_topic(&self, name: &str, partitions: u32, compacted: bool)
        -> BrokerResult<()>;

    async fn partition_count(&self, topic: &str) -> BrokerResult<u32>;

    /// Append a record and return its offset once acknowledged
    async fn produce(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> BrokerResult<i64>;

    /// Read up to `max_records` starting at `offset`, waiting at most `wait`
    /// for the first one. An empty result is a normal idle tick.
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        max_records: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Record>>;

    /// Offset the next append to the partition will receive
    async fn high_watermark(&self, topic: &str, partition: u32) -> BrokerResult<i64>;

    async fn committed(&self, group: &str, topic: &str, partition: u32)
        -> BrokerResult<Option<i64>>;

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> BrokerResult<()>;

    /// Join `group` consuming `topics`; the receiver tracks this member's
    /// assignment across rebalances
    async fn join_group(
        &self,
        group: &str,
        member: &str,
        topics: &[String],
    ) -> BrokerResult<watch::Receiver<Assignment>>;

    async fn leave_group(&self, group: &str, member: &str) -> BrokerResult<()>;

    /// Take ownership of a partition, waiting until its previous owner released it
    async fn acquire(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()>;

    async fn release(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()>;

    /// Append a record to the partition its key hashes to
    async fn produce_keyed(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> BrokerResult<(u32, i64)> {
        let partitions = self.partition_count(topic).await?;
        let partition = partition_for_key(key, partitions);
        let offset = self.produce(topic, partition, key, payload).await?;
        Ok((partition, offset))
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable key partitioner: FNV-1a (32 bit) of the key bytes modulo `partitions`.
///
/// Shared by emitters and changelog writes so that a key's table record
/// lands in the same partition number as the input events for that key.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    let hash = key.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    });
    hash % partitions
}

/// Round-robin assignment: with members sorted by id, partition `p` goes to
/// member `p % members.len()`.
pub fn assign_round_robin(members: &[String], partitions: u32) -> Vec<(String, Vec<u32>)> {
    let mut sorted: Vec<String> = members.to_vec();
    sorted.sort();
    sorted.dedup();

    let count = sorted.len() as u32;
    sorted
        .into_iter()
        .enumerate()
        .map(|(index, member)| {
            let owned = (0..partitions)
                .filter(|p| count > 0 && p % count == index as u32)
                .collect();
            (member, owned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        // FNV-1a 32 reference vectors: "" -> 0x811c9dc5, "a" -> 0xe40c292c
        assert_eq!(partition_for_key("", u32::MAX), 0x811c_9dc5 % u32::MAX);
        assert_eq!(partition_for_key("a", u32::MAX), 0xe40c_292c);
    }

    #[test]
    fn test_partitioner_is_stable() {
        for key in ["1", "2", "coffee", "user-42"] {
            let first = partition_for_key(key, 10);
            assert!(first < 10);
            for _ in 0..5 {
                assert_eq!(partition_for_key(key, 10), first);
            }
        }
        assert_eq!(partition_for_key("anything", 1), 0);
        assert_eq!(partition_for_key("anything", 0), 0);
    }

    #[test]
    fn test_partitioner_spreads_keys() {
        let used: std::collections::HashSet<u32> =
            (0..100).map(|i| partition_for_key(&i.to_string(), 4)).collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_round_robin_assignment() {
        let members = vec!["b".to_string(), "a".to_string()];
        let assignment = assign_round_robin(&members, 5);
        assert_eq!(
            assignment,
            vec![
                ("a".to_string(), vec![0, 2, 4]),
                ("b".to_string(), vec![1, 3]),
            ]
        );

        let single = assign_round_robin(&["only".to_string()], 3);
        assert_eq!(single, vec![("only".to_string(), vec![0, 1, 2])]);
    }
}
