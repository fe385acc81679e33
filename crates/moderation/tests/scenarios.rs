//! End-to-end moderation scenarios on the in-memory broker

use chatflow_config::ChatflowConfig;
use chatflow_types::{BlockList, ChatMessage};
use moderation::{GroupKind, ModerationClient, Pipeline, RunningPipeline, Topics};
use processor::{Broker, MemoryBroker};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn settings() -> ChatflowConfig {
    let mut settings = ChatflowConfig::default();
    settings.broker.default_partitions = 4;
    settings.processing.poll_timeout_ms = 20;
    settings.processing.retry_backoff_ms = 1;
    settings
}

struct Harness {
    broker: MemoryBroker,
    topics: Topics,
    client: ModerationClient,
    running: RunningPipeline,
}

impl Harness {
    async fn start(broker: &MemoryBroker) -> Self {
        let pipeline = Pipeline::new(Arc::new(broker.clone()), settings())
            .unwrap()
            .with_view_timeout(Duration::from_secs(5));
        let running = pipeline
            .start(&GroupKind::ALL, CancellationToken::new())
            .await
            .unwrap();
        let topics = pipeline.topics().clone();
        let client = ModerationClient::new(Arc::new(broker.clone()), &topics, &settings().emitter);
        Self {
            broker: broker.clone(),
            topics,
            client,
            running,
        }
    }

    async fn stop(self) {
        self.client.finish().await.unwrap();
        self.running.shutdown();
        self.running.wait().await.unwrap();
    }

    fn block_list(&self, receiver: &str) -> BlockList {
        self.running
            .blocked_users()
            .and_then(|view| view.get(receiver))
            .unwrap_or_default()
    }

    fn is_banned(&self, word: &str) -> bool {
        self.running
            .banned_words()
            .and_then(|view| view.get(word))
            .unwrap_or(false)
    }

    fn processed(&self, kind: GroupKind) -> u64 {
        self.running.stats(kind).map(|s| s.processed()).unwrap_or(0)
    }

    fn filtered(&self) -> Vec<(String, ChatMessage)> {
        self.broker
            .topic_records("filtered-messages")
            .into_iter()
            .map(|record| {
                let message = self.topics.filtered_messages.decode(&record.payload).unwrap();
                (record.key, message)
            })
            .collect()
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_blocked_sender_is_dropped() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.block(5, 3).await.unwrap();
    eventually("block applied", || h.block_list("5").is_blocked(3)).await;

    h.client.send(3, 5, "hello").await.unwrap();
    eventually("message handled", || h.processed(GroupKind::Filter) == 1).await;

    assert!(h.filtered().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_banned_word_is_masked() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.ban("coffee").await.unwrap();
    eventually("ban applied", || h.is_banned("coffee")).await;

    h.client.send(1, 2, "let's get coffee now").await.unwrap();
    eventually("message forwarded", || h.filtered().len() == 1).await;

    let (key, message) = h.filtered().remove(0);
    assert_eq!(key, "2");
    assert_eq!(message.text, "let's get **** now");
    assert_eq!((message.sender_id, message.receiver_id), (1, 2));
    h.stop().await;
}

#[tokio::test]
async fn test_message_without_state_is_forwarded_to_receiver() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.send(1, 2, "hi").await.unwrap();
    eventually("message forwarded", || h.filtered().len() == 1).await;

    let (key, message) = h.filtered().remove(0);
    assert_eq!(key, "2");
    assert_eq!(message, ChatMessage::new(1, 2, "hi"));

    let partition = h.broker.topic_records("filtered-messages")[0].partition;
    assert_eq!(partition, processor::partition_for_key("2", 4));
    h.stop().await;
}

#[tokio::test]
async fn test_every_blocked_sender_is_dropped() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.block(7, 1).await.unwrap();
    h.client.block(7, 2).await.unwrap();
    eventually("both blocks applied", || {
        let list = h.block_list("7");
        list.is_blocked(1) && list.is_blocked(2)
    })
    .await;

    h.client.send(1, 7, "first").await.unwrap();
    h.client.send(2, 7, "second").await.unwrap();
    h.client.send(3, 7, "third").await.unwrap();
    eventually("messages handled", || h.processed(GroupKind::Filter) == 3).await;

    let filtered = h.filtered();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].1.sender_id, 3);
    h.stop().await;
}

#[tokio::test]
async fn test_repeated_block_is_recorded_once() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.block(7, 1).await.unwrap();
    h.client.block(7, 1).await.unwrap();
    h.client.block(7, 4).await.unwrap();
    eventually("blocks handled", || h.processed(GroupKind::Block) == 3).await;
    eventually("view caught up", || h.block_list("7").len() == 2).await;

    assert_eq!(h.block_list("7").users, vec![1, 4]);
    h.stop().await;
}

#[tokio::test]
async fn test_invalid_block_is_skipped() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    broker.produce_keyed("blocked-users", "7", b"not-a-user").await.unwrap();
    h.client.block(7, 9).await.unwrap();
    eventually("valid block applied", || h.block_list("7").is_blocked(9)).await;

    let stats = h.running.stats(GroupKind::Block).unwrap();
    assert_eq!(stats.skipped(), 1);
    assert_eq!(h.block_list("7").users, vec![9]);
    h.stop().await;
}

#[tokio::test]
async fn test_ban_is_case_insensitive() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    broker.produce_keyed("banned-words", "Music", b"Music").await.unwrap();
    eventually("ban applied", || h.is_banned("music")).await;
    assert!(!h.is_banned("Music"));

    h.client.send(4, 6, "MUSIC all day").await.unwrap();
    eventually("message forwarded", || h.filtered().len() == 1).await;
    assert_eq!(h.filtered()[0].1.text, "**** all day");
    h.stop().await;
}

#[tokio::test]
async fn test_banned_word_inside_token_is_kept() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    h.client.ban("coffee").await.unwrap();
    eventually("ban applied", || h.is_banned("coffee")).await;

    h.client.send(1, 2, "coffeehouse coffee, coffee").await.unwrap();
    eventually("message forwarded", || h.filtered().len() == 1).await;
    assert_eq!(h.filtered()[0].1.text, "coffeehouse coffee, ****");
    h.stop().await;
}

#[tokio::test]
async fn test_block_under_padded_receiver_key_applies() {
    let broker = MemoryBroker::new(4);
    let h = Harness::start(&broker).await;

    broker.produce_keyed("blocked-users", "05", b"3").await.unwrap();
    broker.produce_keyed("blocked-users", "+5", b" 4").await.unwrap();
    eventually("blocks applied", || {
        let list = h.block_list("5");
        list.is_blocked(3) && list.is_blocked(4)
    })
    .await;

    h.client.send(3, 5, "hello").await.unwrap();
    h.client.send(4, 5, "hello").await.unwrap();
    h.client.send(6, 5, "hello").await.unwrap();
    eventually("messages handled", || h.processed(GroupKind::Filter) == 3).await;

    let filtered = h.filtered();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].1.sender_id, 6);
    assert_eq!(h.block_list("05"), BlockList::default());
    h.stop().await;
}

#[tokio::test]
async fn test_tables_survive_restart() {
    let broker = MemoryBroker::new(4);

    let first = Harness::start(&broker).await;
    first.client.block(5, 3).await.unwrap();
    first.client.ban("car").await.unwrap();
    eventually("state applied", || first.block_list("5").is_blocked(3) && first.is_banned("car")).await;
    first.stop().await;

    let second = Harness::start(&broker).await;
    assert!(second.block_list("5").is_blocked(3));
    assert!(second.is_banned("car"));

    second.client.send(3, 5, "hello").await.unwrap();
    second.client.send(1, 5, "nice car").await.unwrap();
    eventually("messages handled", || second.processed(GroupKind::Filter) == 2).await;

    let filtered = second.filtered();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].1.text, "nice ****");
    second.stop().await;
}

#[tokio::test]
async fn test_pipeline_with_sled_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings();
    settings.state.snapshot_dir = Some(dir.path().join("snapshots"));
    settings.processing.snapshot_interval = 1;

    let broker = MemoryBroker::new(4);
    let pipeline = Pipeline::new(Arc::new(broker.clone()), settings.clone()).unwrap();
    let running = pipeline
        .start(&[GroupKind::Ban, GroupKind::Filter], CancellationToken::new())
        .await
        .unwrap();
    let client = ModerationClient::new(Arc::new(broker.clone()), pipeline.topics(), &settings.emitter);

    client.ban("book").await.unwrap();
    let banned = running.banned_words().unwrap().clone();
    eventually("ban applied", || banned.get("book") == Some(true)).await;

    client.send(2, 3, "read a book").await.unwrap();
    eventually("message forwarded", || !broker.topic_records("filtered-messages").is_empty()).await;
    assert!(running.stats(GroupKind::Block).is_none());

    client.finish().await.unwrap();
    running.shutdown();
    running.wait().await.unwrap();

    let payload = broker.topic_records("filtered-messages")[0].payload.clone();
    let message = pipeline.topics().filtered_messages.decode(&payload).unwrap();
    assert_eq!(message.text, "read a ****");
}
