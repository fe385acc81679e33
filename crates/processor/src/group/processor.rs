//! Group member runtime
//!
//! A [`Processor`] joins its group's consumer group and keeps one
//! [`PartitionWorker`] per assigned partition. On every assignment change it
//! stops the workers of revoked partitions (cancel, then await) before it
//! starts workers for newly assigned ones, so a partition's table is never
//! written by two workers of the same member.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definition::GroupGraph;
use super::stats::ProcessorStats;
use super::worker::PartitionWorker;
use crate::broker::{Assignment, Broker};
use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::state::{KeyedStore, SnapshotStore};

struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
    epoch: u64,
}

/// Runs a [`GroupGraph`] as one member of its consumer group
pub struct Processor<V> {
    broker: Arc<dyn Broker>,
    graph: GroupGraph<V>,
    config: ProcessorConfig,
    snapshots: Option<SnapshotStore>,
    member: String,
    stats: Arc<ProcessorStats>,
}

impl<V: Clone + Send + Sync + 'static> Processor<V> {
    pub fn new(broker: Arc<dyn Broker>, graph: GroupGraph<V>, config: ProcessorConfig) -> Self {
        let member = format!("{}-{}", graph.name(), Uuid::new_v4());
        Self {
            broker,
            graph,
            config,
            snapshots: None,
            member,
            stats: Arc::new(ProcessorStats::new()),
        }
    }

    /// Keep table snapshots in `snapshots` every `snapshot_interval` writes
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn member_id(&self) -> &str {
        &self.member
    }

    pub fn graph(&self) -> &GroupGraph<V> {
        &self.graph
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Process until `token` is cancelled or a partition fails fatally.
    ///
    /// Halted partitions and exhausted transport retries are returned as
    /// errors after all workers stopped and the member left its group.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let group = self.graph.name();
        let partitions = self.prepare_topics().await?;
        let store = self.table_store();

        let inputs = self.graph.input_topics();
        let mut assignments = self
            .config
            .retry
            .run_broker("join_group", || {
                self.broker.join_group(group, &self.member, &inputs)
            })
            .await?;
        info!(group, member = %self.member, partitions, inputs = ?inputs, "joined group");

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(u32, u64)>();
        let mut workers: HashMap<u32, WorkerHandle> = HashMap::new();
        let mut epoch = 0u64;

        let outcome = loop {
            let assignment = assignments.borrow_and_update().clone();
            if let Err(e) = self
                .reconcile(&assignment, &mut workers, &mut epoch, &token, &store, &exit_tx)
                .await
            {
                break Err(e);
            }

            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                changed = assignments.changed() => {
                    if changed.is_err() {
                        break Err(ProcessorError::Unexpected(format!(
                            "membership of group '{group}' was closed by the broker"
                        )));
                    }
                }
                Some((partition, exited)) = exit_rx.recv() => {
                    let current = workers.get(&partition).map(|w| w.epoch == exited).unwrap_or(false);
                    if !current {
                        continue;
                    }
                    if let Some(worker) = workers.remove(&partition) {
                        match join_worker(worker).await {
                            Ok(()) if token.is_cancelled() => break Ok(()),
                            Ok(()) => {
                                break Err(ProcessorError::Unexpected(format!(
                                    "worker for partition {partition} of group '{group}' stopped"
                                )))
                            }
                            Err(e) => break Err(e),
                        }
                    }
                }
            }
        };

        let stopped = self.stop_all(&mut workers).await;
        if let Err(e) = self.broker.leave_group(group, &self.member).await {
            warn!(group, member = %self.member, error = %e, "failed to leave group");
        }

        match (outcome, stopped) {
            (Err(e), _) | (Ok(()), Err(e)) => {
                error!(group, member = %self.member, error = %e, "processor stopped with error");
                Err(e)
            }
            (Ok(()), Ok(())) => {
                info!(group, member = %self.member, "processor stopped");
                Ok(())
            }
        }
    }

    /// Check co-partitioning and create the table and dead-letter topics
    async fn prepare_topics(&self) -> Result<u32> {
        let group = self.graph.name();
        let broker = &self.broker;

        let mut counts = Vec::new();
        for topic in self.graph.input_topics() {
            let count = self
                .config
                .retry
                .run_broker("partition_count", || broker.partition_count(&topic))
                .await?;
            counts.push((topic, count));
        }

        let partitions = counts.first().map(|(_, count)| *count).unwrap_or(0);
        if let Some((topic, count)) = counts.iter().find(|(_, count)| *count != partitions) {
            return Err(ProcessorError::Configuration(format!(
                "inputs of group '{group}' are not co-partitioned: '{}' has {partitions} partitions, '{topic}' has {count}",
                counts[0].0
            )));
        }

        if let Some(table) = self.graph.table_topic() {
            broker.create_topic(&table, partitions, true).await?;
            let table_partitions = broker.partition_count(&table).await?;
            if table_partitions != partitions {
                return Err(ProcessorError::Configuration(format!(
                    "table '{table}' has {table_partitions} partitions, inputs of group '{group}' have {partitions}"
                )));
            }
        }
        if let Some(dead_letters) = &self.config.dead_letter_topic {
            broker.create_topic(dead_letters, partitions, false).await?;
        }
        Ok(partitions)
    }

    fn table_store(&self) -> Option<KeyedStore<V>> {
        let codec = self.graph.table_codec()?;
        let store = KeyedStore::new(Arc::clone(&self.broker), self.graph.name(), Arc::clone(codec));
        Some(match &self.snapshots {
            Some(snapshots) if self.config.snapshot_interval > 0 => {
                store.with_snapshots(snapshots.clone(), self.config.snapshot_interval)
            }
            _ => store,
        })
    }

    async fn reconcile(
        &self,
        assignment: &Assignment,
        workers: &mut HashMap<u32, WorkerHandle>,
        epoch: &mut u64,
        token: &CancellationToken,
        store: &Option<KeyedStore<V>>,
        exit_tx: &mpsc::UnboundedSender<(u32, u64)>,
    ) -> Result<()> {
        let group = self.graph.name();

        let revoked: Vec<u32> = workers
            .keys()
            .filter(|partition| !assignment.partitions.contains(partition))
            .copied()
            .collect();
        for partition in &revoked {
            workers[partition].token.cancel();
        }
        let mut first_error = None;
        for partition in revoked {
            if let Some(worker) = workers.remove(&partition) {
                debug!(group, partition, generation = assignment.generation, "stopping revoked partition");
                if let Err(e) = join_worker(worker).await {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        for &partition in &assignment.partitions {
            if workers.contains_key(&partition) {
                continue;
            }
            *epoch += 1;
            let worker_token = token.child_token();
            let worker = PartitionWorker::new(
                self.graph.clone(),
                Arc::clone(&self.broker),
                self.member.clone(),
                partition,
                self.config.clone(),
                store.as_ref().map(|store| store.open_partition(partition)),
                Arc::clone(&self.stats),
            );

            let run_token = worker_token.clone();
            let exit = exit_tx.clone();
            let worker_epoch = *epoch;
            let handle = tokio::spawn(async move {
                let result = worker.run(run_token).await;
                let _ = exit.send((partition, worker_epoch));
                result
            });
            debug!(group, partition, generation = assignment.generation, "started partition worker");
            workers.insert(
                partition,
                WorkerHandle {
                    token: worker_token,
                    handle,
                    epoch: worker_epoch,
                },
            );
        }

        info!(
            group,
            member = %self.member,
            generation = assignment.generation,
            partitions = ?assignment.partitions,
            "assignment applied"
        );
        Ok(())
    }

    async fn stop_all(&self, workers: &mut HashMap<u32, WorkerHandle>) -> Result<()> {
        for worker in workers.values() {
            worker.token.cancel();
        }
        let mut first_error = None;
        for (_, worker) in workers.drain() {
            if let Err(e) = join_worker(worker).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn join_worker(worker: WorkerHandle) -> Result<()> {
    match worker.handle.await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::codec::{StringCodec, Topic};
    use crate::group::GroupBuilder;
    use std::time::Duration;

    fn echo_graph() -> GroupGraph<()> {
        let output = Topic::new("out", StringCodec);
        GroupBuilder::<()>::new("echo")
            .input(Topic::new("in", StringCodec), move |ctx, text: String| {
                let key = ctx.key().to_string();
                ctx.emit(&output, key, &text.to_uppercase())
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_inputs_that_are_not_co_partitioned() {
        let broker = MemoryBroker::new(1);
        broker.create_topic("a", 2, false).await.unwrap();
        broker.create_topic("b", 3, false).await.unwrap();

        let graph = GroupBuilder::<()>::new("join")
            .input(Topic::new("a", StringCodec), |_, _: String| Ok(()))
            .input(Topic::new("b", StringCodec), |_, _: String| Ok(()))
            .build()
            .unwrap();
        let processor = Processor::new(Arc::new(broker), graph, ProcessorConfig::default());

        let result = processor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_runs_until_cancelled() {
        let broker = MemoryBroker::new(2);
        broker.create_topic("in", 2, false).await.unwrap();
        broker.produce_keyed("in", "alice", b"hi").await.unwrap();

        let processor = Arc::new(Processor::new(
            Arc::new(broker.clone()),
            echo_graph(),
            ProcessorConfig::default(),
        ));
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let processor = Arc::clone(&processor);
            let token = token.clone();
            async move { processor.run(token).await }
        });

        for _ in 0..200 {
            if !broker.topic_records("out").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        task.await.unwrap().unwrap();

        let out = broker.topic_records("out");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "alice");
        assert_eq!(out[0].payload, b"HI".to_vec());
        assert_eq!(processor.stats().processed(), 1);
    }
}
