//! Partition worker
//!
//! One worker owns one partition number of a processing group: the matching
//! partition of every input topic and, when the group persists a table, the
//! matching partition of its changelog. The worker
//!
//! 1. acquires the partition (waiting for the previous owner to release it),
//! 2. recovers the table partition,
//! 3. polls the inputs, runs handlers and applies their effects
//!    (table write, emissions, offset commit),
//! 4. commits, snapshots and releases the partition when cancelled.
//!
//! A failed table write rewinds the worker: it recovers the table from the
//! changelog and re-reads from the last completed offset, up to the retry
//! budget. Emissions and commits retry in place.

use futures::future::select_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{Context, Effects, StagedChange};
use super::definition::{DispatchError, GroupGraph};
use super::stats::ProcessorStats;
use crate::broker::{Broker, Record};
use crate::config::{ErrorPolicy, OffsetReset, ProcessorConfig};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::{ProcessorError, Result, StateError};
use crate::state::PartitionStore;

/// Read position of one input topic
#[derive(Debug, Clone)]
struct InputPosition {
    topic: String,
    /// Next offset to fetch
    next: i64,
    /// Offset after the last fully handled record
    done: i64,
    /// Last committed offset
    committed: i64,
}

/// How processing of one record went wrong
#[derive(Debug)]
enum RecordFailure {
    /// Table write failed in transport; the worker rewinds and retries
    Transport(ProcessorError),
    /// The partition must stop
    Fatal(ProcessorError),
}

pub(crate) struct PartitionWorker<V> {
    graph: GroupGraph<V>,
    broker: Arc<dyn Broker>,
    member: String,
    partition: u32,
    config: ProcessorConfig,
    store: Option<PartitionStore<V>>,
    dead_letters: Option<DeadLetterSink>,
    stats: Arc<ProcessorStats>,
}

impl<V: Clone + Send + Sync + 'static> PartitionWorker<V> {
    pub(crate) fn new(
        graph: GroupGraph<V>,
        broker: Arc<dyn Broker>,
        member: String,
        partition: u32,
        config: ProcessorConfig,
        store: Option<PartitionStore<V>>,
        stats: Arc<ProcessorStats>,
    ) -> Self {
        let dead_letters = config
            .dead_letter_topic
            .as_ref()
            .map(|topic| DeadLetterSink::new(Arc::clone(&broker), topic.clone()));
        Self {
            graph,
            broker,
            member,
            partition,
            config,
            store,
            dead_letters,
            stats,
        }
    }

    /// Own the partition until `token` is cancelled or a fatal error occurs
    pub(crate) async fn run(mut self, token: CancellationToken) -> Result<()> {
        let group = self.graph.name().to_string();

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            acquired = self.broker.acquire(&group, &self.member, self.partition) => acquired?,
        }
        info!(group = %group, member = %self.member, partition = self.partition, "partition acquired");

        let result = self.run_owned(&token).await;

        if let Err(e) = self
            .broker
            .release(&group, &self.member, self.partition)
            .await
        {
            warn!(group = %group, partition = self.partition, error = %e, "failed to release partition");
        }
        match &result {
            Ok(()) => info!(group = %group, partition = self.partition, "partition released"),
            Err(e) => error!(group = %group, partition = self.partition, error = %e, "partition worker failed"),
        }
        result
    }

    async fn run_owned(&mut self, token: &CancellationToken) -> Result<()> {
        self.recover_store().await?;
        let mut positions = self.load_positions().await?;
        let mut rewinds = 0u32;

        while !token.is_cancelled() {
            let Some(batch) = self.poll(token, &mut positions).await? else {
                break;
            };

            let mut outcome = Ok(());
            for record in &batch {
                if token.is_cancelled() {
                    break;
                }
                match self.process(record).await {
                    Ok(()) => {
                        if let Some(position) = positions.iter_mut().find(|p| p.topic == record.topic) {
                            position.done = record.offset + 1;
                        }
                    }
                    Err(failure) => {
                        outcome = Err(failure);
                        break;
                    }
                }
            }

            self.commit(&mut positions).await?;

            match outcome {
                Ok(()) => rewinds = 0,
                Err(RecordFailure::Fatal(e)) => return Err(e),
                Err(RecordFailure::Transport(e)) => {
                    if !self.config.retry.should_retry(rewinds) {
                        error!(
                            group = self.graph.name(),
                            partition = self.partition,
                            retries = rewinds,
                            error = %e,
                            "table write retries exhausted"
                        );
                        self.stats.record_failed();
                        return Err(e);
                    }
                    let backoff = self.config.retry.backoff(rewinds);
                    rewinds += 1;
                    warn!(
                        group = self.graph.name(),
                        partition = self.partition,
                        attempt = rewinds,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "table write failed, rewinding to last completed offset"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.recover_store().await?;
                    for position in positions.iter_mut() {
                        position.next = position.done;
                    }
                }
            }
        }

        self.commit(&mut positions).await?;
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.snapshot().await {
                warn!(group = self.graph.name(), partition = self.partition, error = %e, "final snapshot failed");
            }
        }
        Ok(())
    }

    async fn recover_store(&mut self) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };

        let mut retries = 0;
        loop {
            match store.recover().await {
                Ok(recovery) => {
                    self.stats.record_recovery();
                    info!(
                        group = self.graph.name(),
                        partition = self.partition,
                        from_snapshot = recovery.from_snapshot,
                        replayed = recovery.replayed,
                        keys = recovery.keys,
                        "table partition recovered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transport() && self.config.retry.should_retry(retries) => {
                    let backoff = self.config.retry.backoff(retries);
                    retries += 1;
                    warn!(
                        group = self.graph.name(),
                        partition = self.partition,
                        attempt = retries,
                        error = %e,
                        "table recovery failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_positions(&self) -> Result<Vec<InputPosition>> {
        let group = self.graph.name();
        let broker = &self.broker;
        let partition = self.partition;
        let mut positions = Vec::new();

        for topic in self.graph.input_topics() {
            let committed = self
                .config
                .retry
                .run_broker("committed", || broker.committed(group, &topic, partition))
                .await?;
            let start = match committed {
                Some(offset) => offset,
                None => match self.config.offset_reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => {
                        self.config
                            .retry
                            .run_broker("high_watermark", || broker.high_watermark(&topic, partition))
                            .await?
                    }
                },
            };
            debug!(group, partition, topic = %topic, start, "input position loaded");
            positions.push(InputPosition {
                topic,
                next: start,
                done: start,
                committed: committed.unwrap_or(start),
            });
        }
        Ok(positions)
    }

    /// Next batch across all inputs; `None` once cancelled
    async fn poll(
        &self,
        token: &CancellationToken,
        positions: &mut [InputPosition],
    ) -> Result<Option<Vec<Record>>> {
        let broker = &self.broker;
        let partition = self.partition;
        let max = self.config.max_poll_records;

        let mut batch = Vec::new();
        for position in positions.iter_mut() {
            let (topic, offset) = (&position.topic, position.next);
            let records = self
                .config
                .retry
                .run_broker("fetch", || {
                    broker.fetch(topic, partition, offset, max, std::time::Duration::ZERO)
                })
                .await?;
            if let Some(last) = records.last() {
                position.next = last.offset + 1;
            }
            batch.extend(records);
        }
        if !batch.is_empty() {
            return Ok(Some(batch));
        }

        let wait = self.config.poll_timeout;
        let waits = positions
            .iter()
            .enumerate()
            .map(|(index, position)| {
                let broker = Arc::clone(&self.broker);
                let topic = position.topic.clone();
                let offset = position.next;
                Box::pin(async move {
                    (index, broker.fetch(&topic, partition, offset, max, wait).await)
                })
            })
            .collect::<Vec<_>>();

        tokio::select! {
            _ = token.cancelled() => Ok(None),
            ((index, fetched), _, _) = select_all(waits) => match fetched {
                Ok(records) => {
                    if let Some(last) = records.last() {
                        positions[index].next = last.offset + 1;
                    }
                    Ok(Some(records))
                }
                Err(e) => {
                    debug!(group = self.graph.name(), partition, error = %e, "idle fetch failed");
                    tokio::select! {
                        _ = token.cancelled() => Ok(None),
                        _ = tokio::time::sleep(wait) => Ok(Some(Vec::new())),
                    }
                }
            },
        }
    }

    async fn process(&mut self, record: &Record) -> std::result::Result<(), RecordFailure> {
        let dispatched = {
            let Some(handler) = self.graph.handler(&record.topic) else {
                return self
                    .reject(record, "no handler bound to topic".to_string(), false)
                    .await;
            };
            let mut ctx = Context::new(self.graph.name(), record, self.store.as_ref());
            handler
                .dispatch(&mut ctx, &record.payload)
                .map(|()| ctx.into_effects())
        };

        let effects = match dispatched {
            Ok(effects) => effects,
            Err(DispatchError::Decode(e)) => {
                self.stats.record_decode_error();
                return self.reject(record, format!("decode failed: {e}"), false).await;
            }
            Err(DispatchError::Handler(e)) => {
                return self.reject(record, e.to_string(), true).await;
            }
        };

        self.apply(record, effects).await
    }

    async fn apply(&mut self, record: &Record, effects: Effects<V>) -> std::result::Result<(), RecordFailure> {
        if let Some(change) = effects.change {
            let Some(store) = self.store.as_mut() else {
                let e = StateError::NoTable {
                    group: self.graph.name().to_string(),
                };
                return self.reject(record, e.to_string(), true).await;
            };
            let written = match change {
                StagedChange::Set(value) => store.set(&record.key, value).await,
                StagedChange::Delete => store.delete(&record.key).await,
            };
            match written {
                Ok(()) => self.stats.record_state_write(),
                Err(e) if e.is_transport() => return Err(RecordFailure::Transport(e.into())),
                Err(e) => return self.reject(record, e.to_string(), true).await,
            }
        }

        let broker = &self.broker;
        for emit in &effects.emits {
            let delivered = self
                .config
                .retry
                .run_broker("emit", || broker.produce_keyed(&emit.topic, &emit.key, &emit.payload))
                .await;
            match delivered {
                Ok((partition, offset)) => {
                    self.stats.record_emitted();
                    debug!(topic = %emit.topic, partition, offset, key = %emit.key, "emitted");
                }
                Err(e) => {
                    error!(group = self.graph.name(), topic = %emit.topic, error = %e, "emit failed");
                    self.stats.record_failed();
                    return Err(RecordFailure::Fatal(e.into()));
                }
            }
        }

        self.stats.record_processed();
        Ok(())
    }

    /// Skip the record, or stop the partition when `policy_applies` under halt
    async fn reject(
        &self,
        record: &Record,
        reason: String,
        policy_applies: bool,
    ) -> std::result::Result<(), RecordFailure> {
        let group = self.graph.name();

        if policy_applies && self.config.error_policy == ErrorPolicy::Halt {
            error!(
                group,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                key = %record.key,
                reason = %reason,
                "halting partition"
            );
            self.stats.record_failed();
            return Err(RecordFailure::Fatal(ProcessorError::Halted {
                group: group.to_string(),
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                reason,
            }));
        }

        warn!(
            group,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            key = %record.key,
            reason = %reason,
            "skipping event"
        );
        self.stats.record_skipped();
        if let Some(sink) = &self.dead_letters {
            sink.publish_or_log(&DeadLetter::from_record(group, record, reason))
                .await;
            self.stats.record_dead_letter();
        }
        Ok(())
    }

    async fn commit(&self, positions: &mut [InputPosition]) -> Result<()> {
        let group = self.graph.name();
        let broker = &self.broker;
        let partition = self.partition;

        for position in positions.iter_mut().filter(|p| p.done > p.committed) {
            let (topic, next_offset) = (&position.topic, position.done);
            self.config
                .retry
                .run_broker("commit", || broker.commit(group, topic, partition, next_offset))
                .await?;
            position.committed = next_offset;
            self.stats.record_commit(topic, partition, next_offset);
            debug!(group, topic = %topic, partition, next_offset, "offset committed");
        }
        Ok(())
    }
}
