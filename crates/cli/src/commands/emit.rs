//! One-shot publishing commands: send, block, ban

use anyhow::Context;
use chatflow_config::{BrokerMode, ChatflowConfig};
use clap::Args;
use colored::Colorize;
use moderation::{ModerationClient, Topics};
use tracing::warn;

use crate::broker;

/// Options of `chatflow send`
#[derive(Args, Debug, Clone)]
pub struct SendCommand {
    /// Sending user id
    #[arg(long)]
    pub from: i64,

    /// Receiving user id
    #[arg(long)]
    pub to: i64,

    /// Message text
    #[arg(required = true, num_args = 1..)]
    pub text: Vec<String>,
}

/// Options of `chatflow block`
#[derive(Args, Debug, Clone)]
pub struct BlockCommand {
    /// User whose incoming messages are filtered
    #[arg(long)]
    pub user: i64,

    /// User to block
    #[arg(long)]
    pub blocked: i64,
}

/// Options of `chatflow ban`
#[derive(Args, Debug, Clone)]
pub struct BanCommand {
    /// Word to mask in every message
    pub word: String,
}

impl SendCommand {
    pub async fn execute(&self, settings: &ChatflowConfig) -> anyhow::Result<()> {
        let text = self.text.join(" ");
        publish(settings, Event::Message {
            from: self.from,
            to: self.to,
            text: &text,
        })
        .await
    }
}

impl BlockCommand {
    pub async fn execute(&self, settings: &ChatflowConfig) -> anyhow::Result<()> {
        publish(settings, Event::Block {
            user: self.user,
            blocked: self.blocked,
        })
        .await
    }
}

impl BanCommand {
    pub async fn execute(&self, settings: &ChatflowConfig) -> anyhow::Result<()> {
        publish(settings, Event::Ban(&self.word)).await
    }
}

enum Event<'a> {
    Message { from: i64, to: i64, text: &'a str },
    Block { user: i64, blocked: i64 },
    Ban(&'a str),
}

impl Event<'_> {
    fn describe(&self) -> String {
        match self {
            Event::Message { from, to, .. } => format!("message {from} -> {to}"),
            Event::Block { user, blocked } => format!("block of {blocked} for {user}"),
            Event::Ban(word) => format!("ban of '{word}'"),
        }
    }
}

async fn publish(settings: &ChatflowConfig, event: Event<'_>) -> anyhow::Result<()> {
    let what = event.describe();
    if settings.broker.mode == BrokerMode::Memory {
        warn!("in-memory broker: the {what} is only visible to this process");
    }

    let broker = broker::connect(settings)?;
    let topics = Topics::new(&settings.topics)?;
    let client = ModerationClient::new(broker, &topics, &settings.emitter);

    let outcome = match event {
        Event::Message { from, to, text } => client.send(from, to, text).await,
        Event::Block { user, blocked } => client.block(user, blocked).await,
        Event::Ban(word) => client.ban(word).await,
    };
    client.finish().await.context("flushing emitter")?;

    match outcome.with_context(|| format!("publishing {what}"))? {
        Some(delivery) => println!("{} {} {}", "Sent".green().bold(), what, delivery.to_string().dimmed()),
        None => println!("{} {}", "Queued".green().bold(), what),
    }
    Ok(())
}
