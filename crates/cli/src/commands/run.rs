//! Run command - host processing groups until interrupted

use anyhow::Context;
use chatflow_config::{BrokerMode, ChatflowConfig};
use clap::Args;
use colored::Colorize;
use moderation::{GeneratorConfig, GroupKind, ModerationClient, Pipeline, TrafficGenerator};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker;

/// Options of `chatflow run`
#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Groups to run, comma separated
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = parse_group,
        default_values_t = GroupKind::ALL.to_vec()
    )]
    pub groups: Vec<GroupKind>,

    /// Also publish random demo traffic
    #[arg(long)]
    pub with_generator: bool,

    /// Seed of the demo traffic
    #[arg(long, requires = "with_generator")]
    pub seed: Option<u64>,

    /// Number of demo users
    #[arg(long, default_value = "100")]
    pub users: i64,

    /// Milliseconds between demo chat messages
    #[arg(long, default_value = "1000")]
    pub message_interval_ms: u64,
}

fn parse_group(raw: &str) -> Result<GroupKind, String> {
    raw.parse::<GroupKind>().map_err(|e| e.to_string())
}

impl RunCommand {
    pub async fn execute(&self, settings: ChatflowConfig, token: CancellationToken) -> anyhow::Result<()> {
        if settings.broker.mode == BrokerMode::Memory && !self.with_generator {
            warn!("in-memory broker without --with-generator: no events will arrive from other processes");
        }

        let emitter_settings = settings.emitter.clone();
        let broker = broker::connect(&settings)?;
        let pipeline = Pipeline::new(broker.clone(), settings).context("building pipeline")?;

        println!(
            "{} {}",
            "Running groups:".bold().cyan(),
            self.groups.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(", ")
        );
        let running = pipeline.start(&self.groups, token.clone()).await?;

        let generator = if self.with_generator {
            let generator = TrafficGenerator::new(GeneratorConfig {
                message_interval: Duration::from_millis(self.message_interval_ms),
                users: self.users,
                seed: self.seed,
                ..GeneratorConfig::default()
            })?;
            let client = ModerationClient::new(broker, pipeline.topics(), &emitter_settings);
            let token = token.clone();
            Some(tokio::spawn(async move {
                let stats = generator.run(&client, token).await;
                if let Err(e) = client.finish().await {
                    warn!(error = %e, "failed to flush generator traffic");
                }
                stats
            }))
        } else {
            None
        };

        let result = running.wait().await;
        token.cancel();

        if let Some(generator) = generator {
            let stats = generator.await.context("traffic generator task")?;
            info!(
                messages = stats.messages,
                bans = stats.bans,
                blocks = stats.blocks,
                failures = stats.failures,
                "generator summary"
            );
        }

        result?;
        println!("{}", "Stopped.".green());
        Ok(())
    }
}
