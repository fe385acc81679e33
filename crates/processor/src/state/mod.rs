//! Keyed state for processing groups
//!
//! This module provides the table machinery of a processing group:
//!
//! - **Changelog**: compacted `<group>-table` topic, the source of truth
//! - **Keyed store**: per-partition in-memory table with write-through
//! - **Snapshots**: optional local copies that shorten recovery
//! - **Backends**: in-memory (DashMap) and persistent (Sled) byte stores
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use processor::broker::MemoryBroker;
//! use processor::codec::StringCodec;
//! use processor::state::KeyedStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new(4));
//!     let store = KeyedStore::new(broker, "greetings", Arc::new(StringCodec));
//!
//!     let mut partition = store.open_partition(0);
//!     partition.set("alice", "hello".to_string()).await?;
//!     assert_eq!(partition.get("alice").await?, Some(&"hello".to_string()));
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod changelog;
pub mod memory;
pub mod sled_backend;
pub mod snapshot;
pub mod store;

pub use backend::StateBackend;
pub use changelog::{table_topic, Changelog};
pub use memory::MemoryStateBackend;
pub use sled_backend::{SledConfig, SledStateBackend};
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{KeyedStore, PartitionStore, RecoveryStats};
