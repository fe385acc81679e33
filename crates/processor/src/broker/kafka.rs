//! Kafka implementation of [`Broker`]
//!
//! - produce: one shared `FutureProducer`; an empty payload is sent as a
//!   null value so compaction treats it as a tombstone
//! - fetch: one assigned `BaseConsumer` per topic partition, repositioned
//!   whenever the requested offset differs from its cursor
//! - groups: one subscribed `BaseConsumer` per member, polled on a blocking
//!   thread only to drive rebalance callbacks; fetched partitions are paused
//! - ownership: a revocation publishes the reduced assignment and blocks the
//!   rebalance until the member's workers released the revoked partitions

use async_trait::async_trait;
use chatflow_config::ChatflowConfig;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, DefaultConsumerContext, Rebalance,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{BrokerError, BrokerResult};
use super::{Assignment, Broker, Record};
use crate::config::OffsetReset;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection settings of a [`KafkaBroker`]
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaBrokerConfig {
    /// Bootstrap servers, comma separated
    pub brokers: String,
    pub default_partitions: u32,
    pub replication_factor: i32,
    pub offset_reset: OffsetReset,
    /// Timeout of metadata, watermark and offset requests
    pub request_timeout: Duration,
    /// Produce acknowledgement timeout
    pub send_timeout: Duration,
    /// Longest time a revocation waits for workers to release partitions
    pub revoke_timeout: Duration,
    /// Extra client properties
    pub extra: BTreeMap<String, String>,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            default_partitions: 10,
            replication_factor: 1,
            offset_reset: OffsetReset::Earliest,
            request_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            revoke_timeout: Duration::from_secs(30),
            extra: BTreeMap::new(),
        }
    }
}

impl KafkaBrokerConfig {
    pub fn from_settings(settings: &ChatflowConfig) -> Self {
        Self {
            brokers: settings.broker.brokers.join(","),
            default_partitions: settings.broker.default_partitions,
            offset_reset: settings.broker.offset_reset,
            send_timeout: settings.emitter.send_timeout(),
            extra: settings.broker.extra.clone(),
            ..Self::default()
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (key, value) in &self.extra {
            config.set(key, value);
        }
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                match self.offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            );
        config
    }
}

/// Partitions owned by one member's workers
#[derive(Default)]
struct Ownership {
    owned: Mutex<HashSet<u32>>,
    released: Condvar,
}

struct GroupContext {
    group: String,
    member: String,
    sender: watch::Sender<Assignment>,
    generation: AtomicU64,
    current: Mutex<Vec<u32>>,
    ownership: Arc<Ownership>,
    assigned: AtomicBool,
    revoke_timeout: Duration,
}

impl GroupContext {
    fn publish(&self, partitions: Vec<u32>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.current.lock() = partitions.clone();
        self.sender.send_replace(Assignment {
            generation,
            partitions,
        });
    }

    fn wait_released(&self, revoked: &BTreeSet<u32>) {
        let deadline = Instant::now() + self.revoke_timeout;
        let mut owned = self.ownership.owned.lock();
        while revoked.iter().any(|partition| owned.contains(partition)) {
            if self
                .ownership
                .released
                .wait_until(&mut owned, deadline)
                .timed_out()
            {
                warn!(group = %self.group, member = %self.member, ?revoked, "revoked partitions not released in time");
                return;
            }
        }
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let revoked = partition_numbers(tpl);
                let remaining: Vec<u32> = self
                    .current
                    .lock()
                    .iter()
                    .copied()
                    .filter(|partition| !revoked.contains(partition))
                    .collect();
                info!(group = %self.group, member = %self.member, ?revoked, "partitions revoked");
                self.publish(remaining);
                self.wait_released(&revoked);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(group = %self.group, member = %self.member, error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions: Vec<u32> = partition_numbers(tpl).into_iter().collect();
            info!(group = %self.group, member = %self.member, ?partitions, "partitions assigned");
            self.publish(partitions);
            self.assigned.store(true, Ordering::SeqCst);
        }
    }
}

fn partition_numbers(tpl: &TopicPartitionList) -> BTreeSet<u32> {
    tpl.elements()
        .iter()
        .map(|element| element.partition() as u32)
        .collect()
}

struct Member {
    consumer: Arc<BaseConsumer<GroupContext>>,
    stop: Arc<AtomicBool>,
    poller: JoinHandle<()>,
}

struct Reader {
    consumer: BaseConsumer,
    position: Mutex<Option<i64>>,
}

/// [`Broker`] on top of a Kafka cluster
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    readers: Mutex<HashMap<(String, u32), Arc<Reader>>>,
    members: Mutex<HashMap<(String, String), Member>>,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> BrokerResult<Self> {
        if config.brokers.trim().is_empty() {
            return Err(BrokerError::invalid_config(
                "no bootstrap servers configured",
                Some("brokers".to_string()),
            ));
        }

        let producer: FutureProducer = config
            .client_config()
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .create()?;
        let admin: AdminClient<DefaultClientContext> = config.client_config().create()?;

        info!(brokers = %config.brokers, "connected to kafka");
        Ok(Self {
            config,
            producer,
            admin,
            readers: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &KafkaBrokerConfig {
        &self.config
    }

    fn reader(&self, topic: &str, partition: u32) -> BrokerResult<Arc<Reader>> {
        let mut readers = self.readers.lock();
        if let Some(reader) = readers.get(&(topic.to_string(), partition)) {
            return Ok(Arc::clone(reader));
        }
        let consumer: BaseConsumer = self
            .config
            .consumer_config(&format!("{topic}-{partition}-reader"))
            .create()?;
        let reader = Arc::new(Reader {
            consumer,
            position: Mutex::new(None),
        });
        readers.insert((topic.to_string(), partition), Arc::clone(&reader));
        Ok(reader)
    }

    fn member_consumer(&self, group: &str) -> Option<Arc<BaseConsumer<GroupContext>>> {
        self.members
            .lock()
            .iter()
            .find(|((member_group, _), _)| member_group == group)
            .map(|(_, member)| Arc::clone(&member.consumer))
    }

    fn ownership(&self, group: &str, member: &str) -> Option<Arc<Ownership>> {
        self.members
            .lock()
            .get(&(group.to_string(), member.to_string()))
            .map(|member| Arc::clone(&member.consumer.context().ownership))
    }
}

async fn blocking<T, F>(operation: &'static str, f: F) -> BrokerResult<T>
where
    F: FnOnce() -> BrokerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::client(format!("{operation} task failed: {e}"), None))?
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Record {
        topic: message.topic().to_string(),
        partition: message.partition() as u32,
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp,
    }
}

fn committed_offset<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    topic: &str,
    partition: u32,
    timeout: Duration,
) -> BrokerResult<Option<i64>> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition as i32);
    let committed = consumer.committed_offsets(tpl, timeout)?;
    Ok(committed
        .find_partition(topic, partition as i32)
        .and_then(|element| match element.offset() {
            Offset::Offset(offset) => Some(offset),
            _ => None,
        }))
}

fn poll_group(consumer: &BaseConsumer<GroupContext>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        if let Some(Err(e)) = consumer.poll(GROUP_POLL_INTERVAL) {
            debug!(group = %consumer.context().group, error = %e, "group poll error");
        }
        if consumer.context().assigned.swap(false, Ordering::SeqCst) {
            match consumer.assignment() {
                Ok(tpl) => {
                    if let Err(e) = consumer.pause(&tpl) {
                        warn!(group = %consumer.context().group, error = %e, "failed to pause group partitions");
                    }
                }
                Err(e) => warn!(group = %consumer.context().group, error = %e, "failed to read assignment"),
            }
        }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn create_topic(&self, name: &str, partitions: u32, compacted: bool) -> BrokerResult<()> {
        let mut topic = NewTopic::new(
            name,
            partitions as i32,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        if compacted {
            topic = topic.set("cleanup.policy", "compact");
        }
        let options =
            AdminOptions::new().operation_timeout(Some(Timeout::After(self.config.request_timeout)));

        for result in self.admin.create_topics(std::iter::once(&topic), &options).await? {
            match result {
                Ok(created) => info!(topic = %created, partitions, compacted, "created topic"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = name, "topic already exists")
                }
                Err((failed, code)) => {
                    return Err(BrokerError::topic_metadata(code.to_string(), failed));
                }
            }
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> BrokerResult<u32> {
        let producer = self.producer.clone();
        let timeout = self.config.request_timeout;
        let name = topic.to_string();
        blocking("metadata", move || {
            let metadata = producer.client().fetch_metadata(Some(&name), timeout)?;
            let count = metadata
                .topics()
                .iter()
                .find(|entry| entry.name() == name && entry.error().is_none())
                .map(|entry| entry.partitions().len() as u32)
                .unwrap_or(0);
            if count == 0 {
                return Err(BrokerError::UnknownTopic(name));
            }
            Ok(count)
        })
        .await
    }

    async fn produce(&self, topic: &str, partition: u32, key: &str, payload: &[u8]) -> BrokerResult<i64> {
        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .partition(partition as i32)
            .key(key);
        if !payload.is_empty() {
            record = record.payload(payload);
        }

        match self
            .producer
            .send(record, Timeout::After(self.config.send_timeout))
            .await
        {
            Ok((_, offset)) => Ok(offset),
            Err((e, _)) => Err(BrokerError::production(e.to_string(), topic, Some(partition))),
        }
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        max_records: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Record>> {
        let reader = self.reader(topic, partition)?;
        let topic = topic.to_string();

        blocking("fetch", move || {
            let mut position = reader.position.lock();
            if *position != Some(offset) {
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition_offset(&topic, partition as i32, Offset::Offset(offset))?;
                reader.consumer.assign(&tpl)?;
                *position = Some(offset);
            }

            let mut records = Vec::new();
            let mut timeout = wait;
            while records.len() < max_records {
                match reader.consumer.poll(timeout) {
                    None => break,
                    Some(Ok(message)) => {
                        *position = Some(message.offset() + 1);
                        records.push(to_record(&message));
                        timeout = Duration::ZERO;
                    }
                    Some(Err(KafkaError::PartitionEOF(_))) => break,
                    Some(Err(e)) => {
                        *position = None;
                        return Err(BrokerError::consumption(
                            e.to_string(),
                            topic,
                            Some(partition),
                            Some(offset),
                        ));
                    }
                }
            }
            Ok(records)
        })
        .await
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> BrokerResult<i64> {
        let producer = self.producer.clone();
        let timeout = self.config.request_timeout;
        let topic = topic.to_string();
        blocking("watermarks", move || {
            let (_, high) = producer
                .client()
                .fetch_watermarks(&topic, partition as i32, timeout)?;
            Ok(high)
        })
        .await
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> BrokerResult<Option<i64>> {
        let timeout = self.config.request_timeout;
        let topic = topic.to_string();

        if let Some(consumer) = self.member_consumer(group) {
            return blocking("committed", move || {
                committed_offset(&consumer, &topic, partition, timeout)
            })
            .await;
        }

        let consumer: BaseConsumer<DefaultConsumerContext> =
            self.config.consumer_config(group).create()?;
        blocking("committed", move || {
            committed_offset(&consumer, &topic, partition, timeout)
        })
        .await
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next_offset: i64) -> BrokerResult<()> {
        let consumer = self.member_consumer(group).ok_or_else(|| {
            BrokerError::group_coordination("no local member to commit through", group)
        })?;
        let (group, topic) = (group.to_string(), topic.to_string());

        blocking("commit", move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition as i32, Offset::Offset(next_offset))?;
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| BrokerError::offset_commit(e.to_string(), group, topic, partition, next_offset))
        })
        .await
    }

    async fn join_group(
        &self,
        group: &str,
        member: &str,
        topics: &[String],
    ) -> BrokerResult<watch::Receiver<Assignment>> {
        let (sender, receiver) = watch::channel(Assignment::default());
        let context = GroupContext {
            group: group.to_string(),
            member: member.to_string(),
            sender,
            generation: AtomicU64::new(0),
            current: Mutex::new(Vec::new()),
            ownership: Arc::new(Ownership::default()),
            assigned: AtomicBool::new(false),
            revoke_timeout: self.config.revoke_timeout,
        };

        let consumer: BaseConsumer<GroupContext> = self
            .config
            .consumer_config(group)
            .create_with_context(context)?;
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| BrokerError::group_coordination(e.to_string(), group))?;

        let consumer = Arc::new(consumer);
        let stop = Arc::new(AtomicBool::new(false));
        let poller = tokio::task::spawn_blocking({
            let consumer = Arc::clone(&consumer);
            let stop = Arc::clone(&stop);
            move || poll_group(&consumer, &stop)
        });

        info!(group, member, ?topics, "joined kafka consumer group");
        self.members.lock().insert(
            (group.to_string(), member.to_string()),
            Member {
                consumer,
                stop,
                poller,
            },
        );
        Ok(receiver)
    }

    async fn leave_group(&self, group: &str, member: &str) -> BrokerResult<()> {
        let Some(entry) = self
            .members
            .lock()
            .remove(&(group.to_string(), member.to_string()))
        else {
            return Ok(());
        };

        entry.stop.store(true, Ordering::SeqCst);
        if let Err(e) = entry.poller.await {
            warn!(group, member, error = %e, "group poller failed");
        }
        let consumer = entry.consumer;
        blocking("leave_group", move || {
            consumer.unsubscribe();
            drop(consumer);
            Ok(())
        })
        .await?;
        info!(group, member, "left kafka consumer group");
        Ok(())
    }

    async fn acquire(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()> {
        if let Some(ownership) = self.ownership(group, member) {
            ownership.owned.lock().insert(partition);
        }
        Ok(())
    }

    async fn release(&self, group: &str, member: &str, partition: u32) -> BrokerResult<()> {
        if let Some(ownership) = self.ownership(group, member) {
            ownership.owned.lock().remove(&partition);
            ownership.released.notify_all();
        }
        Ok(())
    }
}
