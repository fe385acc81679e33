//! Integration tests for processing groups on the in-memory broker

use processor::broker::MemoryBroker;
use processor::{
    Broker, ErrorPolicy, GroupBuilder, GroupGraph, JsonCodec, Processor, ProcessorConfig,
    ProcessorError, ProcessorStats, RetryPolicy, StringCodec, Topic, View,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn counter_graph() -> GroupGraph<u64> {
    GroupBuilder::<u64>::new("counter")
        .input(Topic::new("clicks", StringCodec), |ctx, _page: String| {
            let count = ctx.value_or_default();
            ctx.set_value(count + 1)
        })
        .persist(JsonCodec::new())
        .build()
        .unwrap()
}

fn fast_config() -> ProcessorConfig {
    ProcessorConfig::default()
        .with_poll_timeout(Duration::from_millis(20))
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("processor=debug")
        .with_test_writer()
        .try_init();
}

struct Running {
    member: String,
    stats: Arc<ProcessorStats>,
    token: CancellationToken,
    handle: JoinHandle<processor::Result<()>>,
}

fn start<V: Clone + Send + Sync + 'static>(
    broker: &MemoryBroker,
    graph: GroupGraph<V>,
    config: ProcessorConfig,
) -> Running {
    init_tracing();
    let processor = Processor::new(Arc::new(broker.clone()), graph, config);
    let member = processor.member_id().to_string();
    let stats = processor.stats();
    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { processor.run(run_token).await });
    Running {
        member,
        stats,
        token,
        handle,
    }
}

async fn stop(running: Running) -> processor::Result<()> {
    running.token.cancel();
    running.handle.await.unwrap()
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

async fn counts(broker: &MemoryBroker) -> View<u64> {
    let view = View::of_group(Arc::new(broker.clone()), "counter", Arc::new(JsonCodec::<u64>::new()));
    let runner = view.clone();
    tokio::spawn(async move { runner.run(CancellationToken::new()).await });
    assert!(view.wait_recovered(Duration::from_secs(5)).await);
    view
}

#[tokio::test]
async fn test_counts_survive_restart() {
    let broker = MemoryBroker::new(2);
    broker.create_topic("clicks", 2, false).await.unwrap();
    for _ in 0..10 {
        broker.produce_keyed("clicks", "alice", b"home").await.unwrap();
    }

    let first = start(&broker, counter_graph(), fast_config());
    let stats = Arc::clone(&first.stats);
    eventually("first run", || stats.processed() == 10).await;
    stop(first).await.unwrap();

    for _ in 0..5 {
        broker.produce_keyed("clicks", "alice", b"home").await.unwrap();
    }
    let second = start(&broker, counter_graph(), fast_config());
    let stats = Arc::clone(&second.stats);
    eventually("second run", || stats.processed() == 5).await;
    stop(second).await.unwrap();

    let view = counts(&broker).await;
    assert_eq!(view.get("alice"), Some(15));
}

#[tokio::test]
async fn test_rebalance_hands_over_partitions_without_losing_updates() {
    let broker = MemoryBroker::new(4);
    broker.create_topic("clicks", 4, false).await.unwrap();
    let keys: Vec<String> = (0..8).map(|i| format!("user-{i}")).collect();

    for _ in 0..5 {
        for key in &keys {
            broker.produce_keyed("clicks", key, b"page").await.unwrap();
        }
    }

    let a = start(&broker, counter_graph(), fast_config());
    let a_stats = Arc::clone(&a.stats);
    eventually("first member", || a_stats.processed() == 40).await;

    let b = start(&broker, counter_graph(), fast_config());
    let members = [a.member.clone(), b.member.clone()];
    eventually("partitions spread over both members", || {
        let owners: HashSet<String> = (0..4).filter_map(|p| broker.owner("counter", p)).collect();
        owners.len() == 2 && owners.iter().all(|owner| members.contains(owner))
    })
    .await;

    for _ in 0..5 {
        for key in &keys {
            broker.produce_keyed("clicks", key, b"page").await.unwrap();
        }
    }
    let b_stats = Arc::clone(&b.stats);
    eventually("both members", || a_stats.processed() + b_stats.processed() == 80).await;
    assert!(b_stats.processed() > 0);

    stop(a).await.unwrap();
    stop(b).await.unwrap();

    let view = counts(&broker).await;
    for key in &keys {
        assert_eq!(view.get(key), Some(10), "count of {key}");
    }
}

#[tokio::test]
async fn test_events_of_one_key_are_handled_in_order() {
    let broker = MemoryBroker::new(4);
    broker.create_topic("seq", 4, false).await.unwrap();
    let graph = GroupBuilder::<Vec<u64>>::new("order")
        .input(Topic::new("seq", JsonCodec::<u64>::new()), |ctx, n: u64| {
            let mut seen = ctx.value_or_default();
            seen.push(n);
            ctx.set_value(seen)
        })
        .persist(JsonCodec::new())
        .build()
        .unwrap();

    let a = start(&broker, graph.clone(), fast_config());
    let b = start(&broker, graph, fast_config());

    let input = Topic::new("seq", JsonCodec::<u64>::new());
    for n in 0..25u64 {
        for key in ["k0", "k1", "k2", "k3"] {
            let payload = input.encode(&n).unwrap();
            broker.produce_keyed("seq", key, &payload).await.unwrap();
        }
    }

    let (a_stats, b_stats) = (Arc::clone(&a.stats), Arc::clone(&b.stats));
    eventually("all events", || a_stats.processed() + b_stats.processed() == 100).await;
    stop(a).await.unwrap();
    stop(b).await.unwrap();

    let view = View::of_group(Arc::new(broker.clone()), "order", Arc::new(JsonCodec::<Vec<u64>>::new()));
    let runner = view.clone();
    tokio::spawn(async move { runner.run(CancellationToken::new()).await });
    assert!(view.wait_recovered(Duration::from_secs(5)).await);

    let expected: Vec<u64> = (0..25).collect();
    for key in ["k0", "k1", "k2", "k3"] {
        assert_eq!(view.get(key), Some(expected.clone()), "sequence of {key}");
    }
}

#[tokio::test]
async fn test_skip_policy_dead_letters_failed_and_undecodable_events() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("amounts", 1, false).await.unwrap();
    let graph = GroupBuilder::<i64>::new("balance")
        .input(Topic::new("amounts", JsonCodec::<i64>::new()), |ctx, amount: i64| {
            if amount < 0 {
                return ctx.fail("negative amount");
            }
            let balance = ctx.value_or_default();
            ctx.set_value(balance + amount)
        })
        .persist(JsonCodec::new())
        .build()
        .unwrap();

    for payload in [&b"5"[..], b"not json", b"-3", b"7"] {
        broker.produce("amounts", 0, "acct", payload).await.unwrap();
    }

    let config = fast_config().with_dead_letter_topic("balance-dlq");
    let running = start(&broker, graph, config);
    let stats = Arc::clone(&running.stats);
    eventually("all events handled", || stats.committed("amounts", 0) == Some(4)).await;
    stop(running).await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.processed, 2);
    assert_eq!(snapshot.skipped, 2);
    assert_eq!(snapshot.decode_errors, 1);
    assert_eq!(broker.topic_records("balance-dlq").len(), 2);

    let table = broker.records("balance-table", 0);
    assert_eq!(table.last().unwrap().payload, b"12".to_vec());
}

#[tokio::test]
async fn test_halt_policy_stops_the_processor() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("amounts", 1, false).await.unwrap();
    let graph = GroupBuilder::<i64>::new("strict")
        .input(Topic::new("amounts", JsonCodec::<i64>::new()), |ctx, amount: i64| {
            if amount < 0 {
                return ctx.fail("negative amount");
            }
            ctx.set_value(amount)
        })
        .persist(JsonCodec::new())
        .build()
        .unwrap();

    for payload in [&b"5"[..], b"-3", b"7"] {
        broker.produce("amounts", 0, "acct", payload).await.unwrap();
    }

    let processor = Processor::new(
        Arc::new(broker.clone()),
        graph,
        fast_config().with_error_policy(ErrorPolicy::Halt),
    );
    let result = tokio::time::timeout(Duration::from_secs(5), processor.run(CancellationToken::new()))
        .await
        .unwrap();

    match result {
        Err(ProcessorError::Halted { offset, reason, .. }) => {
            assert_eq!(offset, 1);
            assert!(reason.contains("negative amount"));
        }
        other => panic!("expected halt, got {other:?}"),
    }
    assert_eq!(broker.committed("strict", "amounts", 0).await.unwrap(), Some(1));
    assert_eq!(broker.owner("strict", 0), None);
}

#[tokio::test]
async fn test_exhausted_table_write_retries_are_fatal() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("clicks", 1, false).await.unwrap();
    broker.produce("clicks", 0, "alice", b"home").await.unwrap();
    broker.fail_produce("counter-table", 100);

    let processor = Processor::new(Arc::new(broker.clone()), counter_graph(), fast_config());
    let result = tokio::time::timeout(Duration::from_secs(5), processor.run(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(ProcessorError::State(_))), "{result:?}");
    assert_eq!(broker.committed("counter", "clicks", 0).await.unwrap(), None);
}

#[tokio::test]
async fn test_exhausted_emit_retries_are_fatal() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("in", 1, false).await.unwrap();
    broker.produce("in", 0, "k", b"hello").await.unwrap();
    broker.fail_produce("out", 100);

    let output = Topic::new("out", StringCodec);
    let graph = GroupBuilder::<()>::new("forward")
        .input(Topic::new("in", StringCodec), move |ctx, text: String| {
            let key = ctx.key().to_string();
            ctx.emit(&output, key, &text)
        })
        .build()
        .unwrap();

    let processor = Processor::new(Arc::new(broker.clone()), graph, fast_config());
    let result = tokio::time::timeout(Duration::from_secs(5), processor.run(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(ProcessorError::Broker(_))), "{result:?}");
    assert_eq!(broker.committed("forward", "in", 0).await.unwrap(), None);
}

#[tokio::test]
async fn test_table_write_happens_before_emission() {
    let broker = MemoryBroker::new(1);
    broker.create_topic("in", 1, false).await.unwrap();
    broker.produce("in", 0, "k", b"x").await.unwrap();

    let output = Topic::new("out", StringCodec);
    let graph = GroupBuilder::<String>::new("tee")
        .input(Topic::new("in", StringCodec), move |ctx, text: String| {
            ctx.set_value(text.clone())?;
            ctx.emit(&output, "k", &text)
        })
        .persist(StringCodec)
        .build()
        .unwrap();

    let running = start(&broker, graph, fast_config());
    let stats = Arc::clone(&running.stats);
    eventually("event handled", || stats.processed() == 1).await;
    stop(running).await.unwrap();

    let table = broker.topic_records("tee-table");
    let out = broker.topic_records("out");
    assert_eq!(table.len(), 1);
    assert_eq!(out.len(), 1);
    assert!(table[0].timestamp <= out[0].timestamp);
    assert!(broker.is_compacted("tee-table"));
}
