//! Read-only replicas of another group's table
//!
//! A [`View`] follows every partition of a `<group>-table` changelog with
//! its own cursor and keeps the latest value per key in memory. It is
//! eventually consistent with the owning group: lookups return whatever has
//! been applied so far and never wait for the source.
//!
//! A view has no mutation methods; only the owning group writes its table.

use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, RetryPolicy};
use crate::codec::Codec;
use crate::error::{ProcessorError, Result};
use crate::state::table_topic;

const VIEW_BATCH: usize = 1000;

struct ViewInner<V> {
    topic: String,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec<V>>,
    table: DashMap<String, V>,
    poll_timeout: Duration,
    retry: RetryPolicy,
    pending: Mutex<Option<usize>>,
    recovered: watch::Sender<bool>,
    applied: AtomicU64,
    stop: CancellationToken,
}

/// Eventually consistent, read-only copy of a group table.
///
/// Clones share the same table and catch-up state.
pub struct View<V> {
    inner: Arc<ViewInner<V>>,
}

impl<V> Clone for View<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> View<V> {
    /// View of the table owned by `group`
    pub fn of_group(broker: Arc<dyn Broker>, group: &str, codec: Arc<dyn Codec<V>>) -> Self {
        Self::new(broker, table_topic(group), codec)
    }

    /// View of an arbitrary table topic
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, codec: Arc<dyn Codec<V>>) -> Self {
        let (recovered, _) = watch::channel(false);
        Self {
            inner: Arc::new(ViewInner {
                topic: topic.into(),
                broker,
                codec,
                table: DashMap::new(),
                poll_timeout: Duration::from_millis(100),
                retry: RetryPolicy::default(),
                pending: Mutex::new(None),
                recovered,
                applied: AtomicU64::new(0),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Latest applied value of `key`
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.table.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.table.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    /// Keys currently in the view, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.table.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Changelog records applied since the view started
    pub fn applied(&self) -> u64 {
        self.inner.applied.load(Ordering::Relaxed)
    }

    /// Whether every partition caught up with the high watermark seen at start
    pub fn is_recovered(&self) -> bool {
        *self.inner.recovered.borrow()
    }

    /// Wait until the view is recovered; returns `false` on timeout
    pub async fn wait_recovered(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.recovered.subscribe();
        let recovered = async move {
            loop {
                let done = *rx.borrow_and_update();
                if done {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, recovered)
            .await
            .unwrap_or(false)
    }

    /// Stop the catch-up loops started by [`View::run`]
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Follow the changelog until `token` is cancelled or [`View::stop`] is called
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let partitions = inner
            .retry
            .run_broker("view partition count", || inner.broker.partition_count(&inner.topic))
            .await?;

        let mut targets = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let end = inner
                .retry
                .run_broker("view high watermark", || {
                    inner.broker.high_watermark(&inner.topic, partition)
                })
                .await?;
            targets.push((partition, end));
        }

        let behind = targets.iter().filter(|(_, end)| *end > 0).count();
        *inner.pending.lock() = Some(behind);
        if behind == 0 {
            inner.recovered.send_replace(true);
        }
        info!(topic = %inner.topic, partitions, behind, "view started");

        let token = combine(&token, &inner.stop);
        let loops = targets
            .into_iter()
            .map(|(partition, end)| self.follow(partition, end, token.clone()));
        try_join_all(loops).await?;

        debug!(topic = %inner.topic, "view stopped");
        Ok(())
    }

    async fn follow(&self, partition: u32, end: i64, token: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let mut next = 0i64;
        let mut caught_up = end <= 0;
        let mut failures = 0u32;

        loop {
            let fetch = inner
                .broker
                .fetch(&inner.topic, partition, next, VIEW_BATCH, inner.poll_timeout);
            let result = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = fetch => result,
            };

            match result {
                Ok(records) => {
                    failures = 0;
                    for record in records {
                        next = record.offset + 1;
                        self.apply(record.key, &record.payload);
                    }
                    if !caught_up && next >= end {
                        caught_up = true;
                        self.partition_caught_up(partition);
                    }
                }
                Err(e) if e.is_fatal() || !inner.retry.should_retry(failures) => {
                    return Err(ProcessorError::Broker(e));
                }
                Err(e) => {
                    let backoff = inner.retry.backoff(failures);
                    failures += 1;
                    warn!(topic = %inner.topic, partition, error = %e, "view fetch failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn apply(&self, key: String, payload: &[u8]) {
        let inner = &self.inner;
        inner.applied.fetch_add(1, Ordering::Relaxed);
        if payload.is_empty() {
            inner.table.remove(&key);
            return;
        }
        match inner.codec.decode(payload) {
            Ok(value) => {
                inner.table.insert(key, value);
            }
            Err(e) => warn!(topic = %inner.topic, key = %key, error = %e, "skipping undecodable table record"),
        }
    }

    fn partition_caught_up(&self, partition: u32) {
        let mut pending = self.inner.pending.lock();
        if let Some(remaining) = pending.as_mut() {
            *remaining = remaining.saturating_sub(1);
            debug!(topic = %self.inner.topic, partition, remaining = *remaining, "view partition caught up");
            if *remaining == 0 {
                self.inner.recovered.send_replace(true);
                info!(topic = %self.inner.topic, keys = self.inner.table.len(), "view recovered");
            }
        }
    }
}

fn combine(outer: &CancellationToken, stop: &CancellationToken) -> CancellationToken {
    let combined = outer.child_token();
    let stop = stop.clone();
    let child = combined.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::codec::StringCodec;
    use crate::state::KeyedStore;

    fn view(broker: &MemoryBroker) -> View<String> {
        View::of_group(Arc::new(broker.clone()), "src", Arc::new(StringCodec))
    }

    #[tokio::test]
    async fn test_view_catches_up_and_follows() {
        let broker = MemoryBroker::new(2);
        broker.create_topic("src-table", 2, true).await.unwrap();
        let store = KeyedStore::new(Arc::new(broker.clone()), "src", Arc::new(StringCodec));
        let mut p0 = store.open_partition(0);
        let mut p1 = store.open_partition(1);
        p0.set("a", "1".to_string()).await.unwrap();
        p1.set("b", "2".to_string()).await.unwrap();

        let view = view(&broker);
        let token = CancellationToken::new();
        let runner = view.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { runner.run(child).await });

        assert!(view.wait_recovered(Duration::from_secs(5)).await);
        assert_eq!(view.get("a"), Some("1".to_string()));
        assert_eq!(view.get("b"), Some("2".to_string()));

        p0.set("a", "3".to_string()).await.unwrap();
        p1.delete("b").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (view.get("a").as_deref() != Some("3") || view.contains("b"))
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(view.get("a"), Some("3".to_string()));
        assert!(!view.contains("b"));
        assert_eq!(view.len(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_table_is_recovered_immediately() {
        let broker = MemoryBroker::new(3);
        let view = view(&broker);
        let runner = view.clone();
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });

        assert!(view.wait_recovered(Duration::from_secs(5)).await);
        assert!(view.is_empty());

        view.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_recovered_times_out_when_not_running() {
        let broker = MemoryBroker::new(1);
        let view = view(&broker);
        assert!(!view.wait_recovered(Duration::from_millis(20)).await);
        assert!(!view.is_recovered());
    }
}
