//! Stateful stream processing core
//!
//! This crate provides the building blocks of keyed, partitioned stream
//! processing on top of a partitioned log:
//!
//! - **Broker**: the log boundary ([`Broker`]), with an in-process
//!   implementation and an optional Kafka one (`kafka` feature)
//! - **Codecs**: typed topics and a per-stream codec registry
//! - **State**: per-partition keyed tables backed by compacted changelogs,
//!   with optional snapshots
//! - **Groups**: declarative processing groups run by [`Processor`]
//! - **Views**: read-only, eventually consistent replicas of group tables
//! - **Emitters**: typed producers with synchronous or queued delivery
//!
//! ## Example
//!
//! ```rust,no_run
//! use processor::broker::MemoryBroker;
//! use processor::codec::{JsonCodec, StringCodec, Topic};
//! use processor::{GroupBuilder, Processor, ProcessorConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new(4));
//!     let clicks = Topic::new("clicks", StringCodec);
//!
//!     let graph = GroupBuilder::<u64>::new("click-counter")
//!         .input(clicks, |ctx, _page: String| {
//!             let count = ctx.value_or_default();
//!             ctx.set_value(count + 1)
//!         })
//!         .persist(JsonCodec::new())
//!         .build()?;
//!
//!     let processor = Processor::new(broker, graph, ProcessorConfig::default());
//!     processor.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod dead_letter;
pub mod emitter;
pub mod error;
pub mod group;
pub mod state;
pub mod view;

pub use broker::{
    partition_for_key, Assignment, Broker, BrokerError, MemoryBroker, Record, RetryPolicy,
};
#[cfg(feature = "kafka")]
pub use broker::{KafkaBroker, KafkaBrokerConfig};
pub use codec::{
    BincodeCodec, BoolCodec, Codec, CodecError, CodecRegistry, JsonCodec, StringCodec, Topic,
};
pub use config::{ErrorPolicy, OffsetReset, ProcessorConfig};
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use emitter::{Delivery, Emitter, EmitterOptions, EmitterStats};
pub use error::{HandlerError, HandlerResult, ProcessorError, Result, StateError};
pub use group::{Context, GroupBuilder, GroupGraph, Processor, ProcessorStats};
pub use state::{KeyedStore, PartitionStore, SnapshotStore};
pub use view::View;
