//! Keyed publishing onto an output stream
//!
//! An [`Emitter`] encodes values with its topic's codec and appends them to
//! the partition the key hashes to. Two delivery modes are available:
//!
//! - [`Emitter::emit_sync`] returns once the broker acknowledged the append
//! - [`Emitter::emit`] queues the record for a background task; the result
//!   is reported to the delivery callback and counted in [`EmitterStats`]
//!
//! [`Emitter::finish`] drains the queue and stops the background task.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, BrokerResult, RetryPolicy};
use crate::codec::Topic;
use crate::error::Result;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Where an emitted record ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Delivery report for asynchronous emits, called with the record key
pub type DeliveryCallback = Arc<dyn Fn(&str, &BrokerResult<Delivery>) + Send + Sync>;

/// Emitter options
#[derive(Clone)]
pub struct EmitterOptions {
    /// Retry budget for each append
    pub retry: RetryPolicy,
    /// Upper bound on a single append attempt
    pub send_timeout: Option<Duration>,
    /// Capacity of the asynchronous queue
    pub queue_capacity: usize,
    pub on_delivery: Option<DeliveryCallback>,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            send_timeout: Some(Duration::from_secs(5)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_delivery: None,
        }
    }
}

impl EmitterOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn on_delivery<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &BrokerResult<Delivery>) + Send + Sync + 'static,
    {
        self.on_delivery = Some(Arc::new(callback));
        self
    }
}

/// Emitter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    pub sent: u64,
    pub failed: u64,
    pub queued: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
}

enum Job {
    Send { key: String, payload: Vec<u8> },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Publisher {
    broker: Arc<dyn Broker>,
    topic: String,
    retry: RetryPolicy,
    send_timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl Publisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> BrokerResult<Delivery> {
        let result = self
            .retry
            .run_broker("emit", || self.attempt(key, payload))
            .await;

        match &result {
            Ok(delivery) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!(key, %delivery, "emitted record");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, key, error = %e, "emit failed");
            }
        }
        result
    }

    async fn attempt(&self, key: &str, payload: &[u8]) -> BrokerResult<Delivery> {
        let produce = self.broker.produce_keyed(&self.topic, key, payload);
        let (partition, offset) = match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, produce)
                .await
                .map_err(|_| BrokerError::timeout("emit", timeout.as_millis() as u64))??,
            None => produce.await?,
        };
        Ok(Delivery {
            topic: self.topic.clone(),
            partition,
            offset,
        })
    }
}

/// Publishes `T` values onto one topic
pub struct Emitter<T> {
    topic: Topic<T>,
    publisher: Publisher,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: 'static> Emitter<T> {
    /// Create an emitter with default options. Must be called within a tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, topic: Topic<T>) -> Self {
        Self::with_options(broker, topic, EmitterOptions::default())
    }

    pub fn with_options(broker: Arc<dyn Broker>, topic: Topic<T>, options: EmitterOptions) -> Self {
        let publisher = Publisher {
            broker,
            topic: topic.name().to_string(),
            retry: options.retry,
            send_timeout: options.send_timeout,
            counters: Arc::new(Counters::default()),
        };

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let worker = tokio::spawn(run_queue(publisher.clone(), rx, options.on_delivery));

        Self {
            topic,
            publisher,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn topic(&self) -> &Topic<T> {
        &self.topic
    }

    /// Encode and append `value`, returning once the broker acknowledged it
    pub async fn emit_sync(&self, key: &str, value: &T) -> Result<Delivery> {
        let payload = self.topic.encode(value)?;
        Ok(self.publisher.publish(key, &payload).await?)
    }

    /// Encode `value` and queue it for background delivery.
    ///
    /// Waits only for queue capacity, not for the broker.
    pub async fn emit(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let payload = self.topic.encode(value)?;
        let tx = self.sender()?;
        tx.send(Job::Send {
            key: key.into(),
            payload,
        })
        .await
        .map_err(|_| BrokerError::Closed)?;
        self.publisher.counters.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until every record queued so far has been delivered or failed
    pub async fn flush(&self) -> Result<()> {
        let tx = self.sender()?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Job::Flush(done_tx))
            .await
            .map_err(|_| BrokerError::Closed)?;
        done_rx.await.map_err(|_| BrokerError::Closed)?;
        Ok(())
    }

    /// Flush and stop the background task; later emits fail with `Closed`
    pub async fn finish(&self) -> Result<()> {
        let sender = self.queue.lock().take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await?;
        }
        debug!(topic = self.topic.name(), "emitter finished");
        Ok(())
    }

    pub fn stats(&self) -> EmitterStats {
        let counters = &self.publisher.counters;
        EmitterStats {
            sent: counters.sent.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            queued: counters.queued.load(Ordering::Relaxed),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        Ok(self.queue.lock().clone().ok_or(BrokerError::Closed)?)
    }
}

impl<T> Drop for Emitter<T> {
    fn drop(&mut self) {
        // Dropping the sender lets the queue drain and the task exit on its own
        self.queue.lock().take();
    }
}

async fn run_queue(
    publisher: Publisher,
    mut rx: mpsc::Receiver<Job>,
    on_delivery: Option<DeliveryCallback>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Send { key, payload } => {
                let result = publisher.publish(&key, &payload).await;
                if let Some(callback) = &on_delivery {
                    callback(&key, &result);
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
