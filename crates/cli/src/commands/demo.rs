//! Demo command - the moderation scenarios end-to-end on an in-memory broker

use anyhow::{bail, Context};
use chatflow_config::{BrokerMode, ChatflowConfig};
use chatflow_types::BlockList;
use clap::Args;
use colored::Colorize;
use moderation::{GroupKind, ModerationClient, Pipeline, RunningPipeline};
use processor::MemoryBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Options of `chatflow demo`
#[derive(Args, Debug, Clone)]
pub struct DemoCommand {
    /// Partitions of every demo topic
    #[arg(long, default_value = "4")]
    pub partitions: u32,
}

impl DemoCommand {
    pub async fn execute(&self, mut settings: ChatflowConfig) -> anyhow::Result<()> {
        settings.broker.mode = BrokerMode::Memory;
        settings.broker.default_partitions = self.partitions;
        settings.processing.poll_timeout_ms = settings.processing.poll_timeout_ms.min(20);
        settings.state.snapshot_dir = None;

        let emitter_settings = settings.emitter.clone();
        let broker = MemoryBroker::new(self.partitions);
        let pipeline = Pipeline::new(Arc::new(broker.clone()), settings)?;
        let running = pipeline
            .start(&GroupKind::ALL, CancellationToken::new())
            .await
            .context("starting pipeline")?;
        let client = ModerationClient::new(Arc::new(broker.clone()), pipeline.topics(), &emitter_settings);
        let demo = Demo {
            broker,
            running: &running,
            client: &client,
            pipeline: &pipeline,
        };

        let outcome = demo.scenarios().await;
        client.finish().await?;
        running.shutdown();
        running.wait().await?;
        outcome
    }
}

struct Demo<'a> {
    broker: MemoryBroker,
    running: &'a RunningPipeline,
    client: &'a ModerationClient,
    pipeline: &'a Pipeline,
}

impl Demo<'_> {
    async fn scenarios(&self) -> anyhow::Result<()> {
        println!("{}", "Chat moderation demo".bold().cyan());
        println!("{}", "=".repeat(40));

        self.heading("A", "receiver 5 blocks sender 3, then 3 writes to 5");
        self.client.block(5, 3).await?;
        self.wait_block(5, 3).await?;
        self.send(3, 5, "hello").await?;

        self.heading("B", "'coffee' is banned, then 1 writes to 2");
        self.client.ban("coffee").await?;
        self.wait_ban("coffee").await?;
        self.send(1, 2, "let's get coffee now").await?;

        self.heading("C", "1 writes to 2 without any rule involved");
        self.send(1, 2, "hi").await?;

        self.heading("D", "receiver 7 blocks senders 1 and 2, both write to 7");
        self.client.block(7, 1).await?;
        self.client.block(7, 2).await?;
        self.wait_block(7, 1).await?;
        self.wait_block(7, 2).await?;
        self.send(1, 7, "are you there?").await?;
        self.send(2, 7, "me too").await?;

        self.print_output();
        Ok(())
    }

    fn heading(&self, name: &str, description: &str) {
        println!();
        println!("{} {}", format!("Scenario {name}:").bold(), description);
    }

    /// Send a message and wait until the filter group handled it
    async fn send(&self, from: i64, to: i64, text: &str) -> anyhow::Result<()> {
        let stats = self
            .running
            .stats(GroupKind::Filter)
            .context("filter group is not running")?;
        let before = stats.processed();
        self.client.send(from, to, text).await?;
        println!("  {} {} -> {}: {}", "sent".dimmed(), from, to, text);

        wait_until(|| stats.processed() > before).await?;
        Ok(())
    }

    async fn wait_block(&self, receiver: i64, blocked: i64) -> anyhow::Result<()> {
        let view = self.running.blocked_users().context("block list view is not running")?;
        let key = receiver.to_string();
        wait_until(|| {
            view.get(&key)
                .map(|list: BlockList| list.is_blocked(blocked))
                .unwrap_or(false)
        })
        .await
    }

    async fn wait_ban(&self, word: &str) -> anyhow::Result<()> {
        let view = self.running.banned_words().context("banned words view is not running")?;
        wait_until(|| view.get(word).unwrap_or(false)).await
    }

    fn print_output(&self) {
        let output = &self.pipeline.topics().filtered_messages;
        println!();
        println!("{}", format!("Output on '{}':", output.name()).bold().cyan());
        for record in self.broker.topic_records(output.name()) {
            match output.decode(&record.payload) {
                Ok(message) => println!(
                    "  [{}] {} -> {}: {}",
                    record.key.yellow(),
                    message.sender_id,
                    message.receiver_id,
                    message.text.green()
                ),
                Err(e) => println!("  [{}] {}", record.key.yellow(), e.to_string().red()),
            }
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            bail!("demo step did not complete within {}s", STEP_TIMEOUT.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs_all_scenarios() {
        let command = DemoCommand { partitions: 2 };
        command.execute(ChatflowConfig::default()).await.unwrap();
    }
}
