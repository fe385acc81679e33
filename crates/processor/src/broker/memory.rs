//! In-process partitioned log broker
//!
//! Topics are vectors of records per partition where a record's offset is
//! its index. Topics are created on first use with the broker's default
//! partition count. Compaction is not performed physically; readers of table
//! topics apply records last-write-wins, which yields the same state.
//!
//! The broker also coordinates consumer groups (round-robin assignment,
//! generation per membership change), stores committed offsets, fences
//! partition ownership, and can inject produce failures for tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::error::{BrokerError, BrokerResult};
use super::{assign_round_robin, Assignment, Broker, Record};

#[derive(Debug)]
struct TopicLog {
    compacted: bool,
    partitions: Vec<Vec<Record>>,
}

impl TopicLog {
    fn new(partitions: u32, compacted: bool) -> Self {
        Self {
            compacted,
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
        }
    }
}

struct GroupState {
    generation: u64,
    partitions: u32,
    members: BTreeMap<String, watch::Sender<Assignment>>,
}

impl GroupState {
    fn rebalance(&mut self, group: &str) {
        self.generation += 1;
        let members: Vec<String> = self.members.keys().cloned().collect();
        for (member, partitions) in assign_round_robin(&members, self.partitions) {
            debug!(group, member = %member, generation = self.generation, ?partitions, "assigning partitions");
            if let Some(sender) = self.members.get(&member) {
                sender.send_replace(Assignment {
                    generation: self.generation,
                    partitions,
                });
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    topics: RwLock<HashMap<String, TopicLog>>,
    offsets: DashMap<(String, String, u32), i64>,
    groups: Mutex<HashMap<String, GroupState>>,
    owners: Mutex<HashMap<(String, u32), String>>,
    fail_produce: Mutex<HashMap<String, u32>>,
    appended: Notify,
    released: Notify,
    default_partitions: u32,
}

/// In-memory broker; clones share the same logs
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// Create a broker whose implicitly created topics have `default_partitions`
    pub fn new(default_partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_partitions: default_partitions.max(1),
                ..Inner::default()
            }),
        }
    }

    /// Make the next produce to `topic` fail
    pub fn fail_next_produce(&self, topic: &str) {
        self.fail_produce(topic, 1);
    }

    /// Make the next `times` produces to `topic` fail
    pub fn fail_produce(&self, topic: &str, times: u32) {
        let mut failures = self.inner.fail_produce.lock();
        *failures.entry(topic.to_string()).or_insert(0) += times;
    }

    /// All records of one partition, in offset order
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Record> {
        self.inner
            .topics
            .read()
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// All records of a topic, partition by partition
    pub fn topic_records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_compacted(&self, topic: &str) -> bool {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|log| log.compacted)
            .unwrap_or(false)
    }

    /// Current owner of a group partition, if any
    pub fn owner(&self, group: &str, partition: u32) -> Option<String> {
        self.inner
            .owners
            .lock()
            .get(&(group.to_string(), partition))
            .cloned()
    }

    fn ensure_topic(&self, topic: &str) -> u32 {
        if let Some(log) = self.inner.topics.read().get(topic) {
            return log.partitions.len() as u32;
        }
        let mut topics = self.inner.topics.write();
        let log = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, partitions = self.inner.default_partitions, "auto-creating topic");
            TopicLog::new(self.inner.default_partitions, false)
        });
        log.partitions.len() as u32
    }

    fn check_partition(&self, topic: &str, partition: u32) -> BrokerResult<()> {
        if partition >= self.ensure_topic(topic) {
            return Err(BrokerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(())
    }

    fn read(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        max_records: usize,
    ) -> BrokerResult<Vec<Record>> {
        self.check_partition(topic, partition)?;
        let topics = self.inner.topics.read();
        let log = topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .ok_or_else(|| BrokerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;

        let start = offset.max(0) as usize;
        Ok(log.iter().skip(start).take(max_records).cloned().collect())
    }

    fn take_injected_failure(&self, topic: &str) -> bool {
        let mut failures = self.inner.fail_produce.lock();
        match failures.get_mut(topic) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_topic(
        &self,
        name: &str,
        partitions: u32,
        compacted: bool,
    ) -> BrokerResult<()> {
        if partitions == 0 {
            return Err(BrokerError::invalid_config(
                format!("topic {} needs at least one partition", name),
                Some("partitions".to_string()),
            ));
        }

        let mut topics = self.inner.topics.write();
        if let Some(existing) = topics.get_mut(name) {
            existing.compacted |= compacted;
            return Ok(());
        }
        info!(topic = name, partitions, compacted, "creating topic");
        topics.insert(name.to_string(), TopicLog::new(partitions, compacted));
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> BrokerResult<u32> {
        Ok(self.ensure_topic(topic))
    }

    async fn produce(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> BrokerResult<i64> {
        if self.take_injected_failure(topic) {
            return Err(BrokerError::production(
                "injected produce failure",
                topic,
                Some(partition),
            ));
        }
        self.check_partition(topic, partition)?;

        let offset = {
            let mut topics = self.inner.topics.write();
            let log = topics
                .get_mut(topic)
                .and_then(|log| log.partitions.get_mut(partition as usize))
                .ok_or_else(|| BrokerError::PartitionNotFound {
                    topic: topic.to_string(),
                    partition,
                })?;
            let offset = log.len() as i64;
            log.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.to_string(),
                payload: payload.to_vec(),
                timestamp: Utc::now(),
            });
            offset
        };

        trace!(topic, partition, offset, key, "appended record");
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        max_records: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Record>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.read(topic, partition, offset, max_records)?;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> BrokerResult<i64> {
        self.check_partition(topic, partition)?;
        Ok(self.records_len(topic, partition))
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> BrokerResult<Option<i64>> {
        Ok(self
            .inner
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry.value()))
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> BrokerResult<()> {
        trace!(group, topic, partition, next_offset, "committing offset");
        self.inner
            .offsets
            .insert((group.to_string(), topic.to_string(), partition), next_offset);
        Ok(())
    }

    async fn join_group(
        &self,
        group: &str,
        member: &str,
        topics: &[String],
    ) -> BrokerResult<watch::Receiver<Assignment>> {
        let mut partitions = 0;
        for topic in topics {
            partitions = partitions.max(self.ensure_topic(topic));
        }

        let mut groups = self.inner.groups.lock();
        let state = groups.entry(group.to_string()).or_insert_with(|| GroupState {
            generation: 0,
            partitions: 0,
            members: BTreeMap::new(),
        });
        state.partitions = state.partitions.max(partitions);
        let receiver = state
            .members
            .entry(member.to_string())
            .or_insert_with(|| watch::channel(Assignment::default()).0)
            .subscribe();

        info!(group, member, members = state.members.len(), "member joined group");
        state.rebalance(group);
        Ok(receiver)
    }

    async fn leave_group(&self, group: &str, member: &str) -> BrokerResult<()> {
        {
            let mut groups = self.inner.groups.lock();
            if let Some(state) = groups.get_mut(group) {
                if state.members.remove(member).is_some() {
                    info!(group, member, members = state.members.len(), "member left group");
                    state.rebalance(group);
                }
            }
        }

        self.inner
            .owners
            .lock()
            .retain(|(owned_group, _), owner| !(owned_group == group && owner.as_str() == member));
        self.inner.released.notify_waiters();
        Ok(())
    }

    async fn acquire(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()> {
        let slot = (group.to_string(), partition);
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut owners = self.inner.owners.lock();
                match owners.get(&slot) {
                    None => {
                        owners.insert(slot, member.to_string());
                        trace!(group, member, partition, "acquired partition");
                        return Ok(());
                    }
                    Some(owner) if owner == member => return Ok(()),
                    Some(owner) => {
                        debug!(group, member, partition, owner = %owner, "waiting for partition release");
                    }
                }
            }

            notified.await;
        }
    }

    async fn release(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()> {
        let slot = (group.to_string(), partition);
        let mut owners = self.inner.owners.lock();
        if owners.get(&slot).map(|owner| owner == member).unwrap_or(false) {
            owners.remove(&slot);
            trace!(group, member, partition, "released partition");
        }
        drop(owners);
        self.inner.released.notify_waiters();
        Ok(())
    }
}

impl MemoryBroker {
    fn records_len(&self, topic: &str, partition: u32) -> i64 {
        self.inner
            .topics
            .read()
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_and_fetch() {
        let broker = MemoryBroker::new(2);
        broker.create_topic("t", 2, false).await.unwrap();

        assert_eq!(broker.produce("t", 1, "k", b"a").await.unwrap(), 0);
        assert_eq!(broker.produce("t", 1, "k", b"b").await.unwrap(), 1);
        assert_eq!(broker.high_watermark("t", 1).await.unwrap(), 2);
        assert_eq!(broker.high_watermark("t", 0).await.unwrap(), 0);

        let records = broker.fetch("t", 1, 1, 10, Duration::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 1);
        assert_eq!(records[0].payload, b"b".to_vec());

        let err = broker.produce("t", 5, "k", b"x").await.unwrap_err();
        assert!(matches!(err, BrokerError::PartitionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_waits_for_append() {
        let broker = MemoryBroker::new(1);
        let producer = broker.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("t", 0, "k", b"late").await.unwrap();
        });

        let records = broker
            .fetch("t", 0, 0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_idle_tick_is_empty() {
        let broker = MemoryBroker::new(1);
        let records = broker
            .fetch("t", 0, 0, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_produce_keyed_uses_partitioner() {
        let broker = MemoryBroker::new(4);
        let (partition, offset) = broker.produce_keyed("t", "user-7", b"x").await.unwrap();
        assert_eq!(partition, super::super::partition_for_key("user-7", 4));
        assert_eq!(offset, 0);
        assert_eq!(broker.records("t", partition).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_produce_failure() {
        let broker = MemoryBroker::new(1);
        broker.fail_next_produce("t");

        assert!(broker.produce("t", 0, "k", b"x").await.is_err());
        assert!(broker.produce("t", 0, "k", b"x").await.is_ok());
        assert_eq!(broker.topic_records("t").len(), 1);
    }

    #[tokio::test]
    async fn test_commit_and_committed() {
        let broker = MemoryBroker::new(1);
        assert_eq!(broker.committed("g", "t", 0).await.unwrap(), None);
        broker.commit("g", "t", 0, 12).await.unwrap();
        assert_eq!(broker.committed("g", "t", 0).await.unwrap(), Some(12));
        assert_eq!(broker.committed("other", "t", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_group_rebalance() {
        let broker = MemoryBroker::new(4);
        let topics = vec!["t".to_string()];

        let mut a = broker.join_group("g", "a", &topics).await.unwrap();
        assert_eq!(a.borrow_and_update().partitions, vec![0, 1, 2, 3]);
        let first_generation = a.borrow().generation;

        let b = broker.join_group("g", "b", &topics).await.unwrap();
        assert_eq!(b.borrow().partitions, vec![1, 3]);
        assert!(a.has_changed().unwrap());
        assert_eq!(a.borrow_and_update().partitions, vec![0, 2]);
        assert!(a.borrow().generation > first_generation);

        broker.leave_group("g", "b").await.unwrap();
        assert_eq!(a.borrow_and_update().partitions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let broker = MemoryBroker::new(1);
        broker.acquire("g", "a", 0).await.unwrap();
        assert_eq!(broker.owner("g", 0), Some("a".to_string()));

        let contender = broker.clone();
        let waiter = tokio::spawn(async move { contender.acquire("g", "b", 0).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        broker.release("g", "a", 0).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(broker.owner("g", 0), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_create_topic_is_idempotent() {
        let broker = MemoryBroker::new(1);
        broker.create_topic("g-table", 3, true).await.unwrap();
        broker.create_topic("g-table", 8, true).await.unwrap();
        assert_eq!(broker.partition_count("g-table").await.unwrap(), 3);
        assert!(broker.is_compacted("g-table"));
        assert!(broker.create_topic("empty", 0, false).await.is_err());
    }
}
