//! Integration tests for keyed tables, snapshots and views

use processor::broker::MemoryBroker;
use processor::state::{MemoryStateBackend, SledConfig, SledStateBackend};
use processor::{
    Broker, GroupBuilder, JsonCodec, KeyedStore, Processor, ProcessorConfig, SnapshotStore,
    StringCodec, Topic, View,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_table_recovers_from_sled_snapshot_and_changelog_tail() {
    let temp_dir = TempDir::new().unwrap();
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(1));

    {
        let backend = SledStateBackend::open(SledConfig::new(temp_dir.path())).await.unwrap();
        let snapshots = SnapshotStore::new(Arc::new(backend));
        let store = KeyedStore::new(Arc::clone(&broker), "scores", Arc::new(JsonCodec::<u32>::new()))
            .with_snapshots(snapshots, 2);

        let mut partition = store.open_partition(0);
        partition.set("alice", 1).await.unwrap();
        partition.set("bob", 2).await.unwrap();
        partition.set("alice", 3).await.unwrap();
    }

    let backend = SledStateBackend::open(SledConfig::new(temp_dir.path())).await.unwrap();
    let snapshots = SnapshotStore::new(Arc::new(backend));
    let store = KeyedStore::new(Arc::clone(&broker), "scores", Arc::new(JsonCodec::<u32>::new()))
        .with_snapshots(snapshots, 2);

    let mut partition = store.open_partition(0);
    let recovery = partition.recover().await.unwrap();
    assert!(recovery.from_snapshot);
    assert_eq!(recovery.replayed, 1);
    assert_eq!(recovery.next_offset, 3);
    assert_eq!(partition.peek("alice"), Some(&3));
    assert_eq!(partition.peek("bob"), Some(&2));
}

#[tokio::test]
async fn test_processor_with_snapshots_matches_changelog_state() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("words", 1, false).await.unwrap();
    for word in ["a", "b", "a", "c", "a"] {
        broker.produce("words", 0, word, word.as_bytes()).await.unwrap();
    }

    let backend = Arc::new(MemoryStateBackend::new());
    let graph = GroupBuilder::<u32>::new("word-count")
        .input(Topic::new("words", StringCodec), |ctx, _word: String| {
            let count = ctx.value_or_default();
            ctx.set_value(count + 1)
        })
        .persist(JsonCodec::new())
        .build()
        .unwrap();

    let processor = Processor::new(
        Arc::new(broker.clone()),
        graph,
        ProcessorConfig::default().with_snapshot_interval(3),
    )
    .with_snapshots(SnapshotStore::new(backend.clone()));
    let stats = processor.stats();
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { processor.run(token).await }
    });

    for _ in 0..500 {
        if stats.processed() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    handle.await.unwrap().unwrap();

    let view = View::of_group(Arc::new(broker.clone()), "word-count", Arc::new(JsonCodec::<u32>::new()));
    let runner = view.clone();
    tokio::spawn(async move { runner.run(CancellationToken::new()).await });
    assert!(view.wait_recovered(Duration::from_secs(5)).await);
    assert_eq!(view.get("a"), Some(3));
    assert_eq!(view.get("b"), Some(1));
    assert_eq!(view.get("c"), Some(1));

    let snapshot = SnapshotStore::new(backend)
        .load("word-count", 0)
        .await
        .unwrap()
        .expect("final snapshot written on shutdown");
    assert_eq!(snapshot.next_offset, 5);
    assert_eq!(snapshot.entries.len(), 3);
}

#[tokio::test]
async fn test_view_follows_updates_and_deletes() {
    let broker = MemoryBroker::new(2);
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());
    let store = KeyedStore::new(Arc::clone(&shared), "profiles", Arc::new(StringCodec));
    broker.create_topic("profiles-table", 2, true).await.unwrap();

    let mut p0 = store.open_partition(0);
    p0.set("alice", "v1".to_string()).await.unwrap();

    let view = View::of_group(shared, "profiles", Arc::new(StringCodec));
    let token = CancellationToken::new();
    let runner = view.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(run_token).await });
    assert!(view.wait_recovered(Duration::from_secs(5)).await);
    assert_eq!(view.get("alice"), Some("v1".to_string()));

    let mut p1 = store.open_partition(1);
    p1.set("bob", "v1".to_string()).await.unwrap();
    p0.set("alice", "v2".to_string()).await.unwrap();
    p0.delete("alice").await.unwrap();

    for _ in 0..500 {
        if view.applied() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(view.get("alice"), None);
    assert_eq!(view.get("bob"), Some("v1".to_string()));
    assert_eq!(view.keys(), vec!["bob".to_string()]);

    token.cancel();
    handle.await.unwrap().unwrap();
}
