//! chatflow CLI
//!
//! Runs the moderation processing groups, publishes single events, and
//! demonstrates the pipeline against an in-memory broker.

mod broker;
mod commands;

use anyhow::Context;
use chatflow_config::ChatflowConfig;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use commands::{BanCommand, BlockCommand, DemoCommand, RunCommand, SendCommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "chatflow",
    version,
    about = "Stateful chat moderation on partitioned streams",
    long_about = "Stateful chat moderation on partitioned streams.\n\n\
                  Three processing groups keep per-receiver block lists and banned\n\
                  words, and forward chat messages with banned words masked."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        help = "Path to a YAML configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,

    /// Log format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run processing groups until interrupted
    #[command(name = "run")]
    Run(RunCommand),

    /// Send a chat message
    #[command(name = "send")]
    Send(SendCommand),

    /// Block a sender for a receiver
    #[command(name = "block")]
    Block(BlockCommand),

    /// Ban a word
    #[command(name = "ban")]
    Ban(BanCommand),

    /// Walk through the moderation scenarios on an in-memory broker
    #[command(name = "demo")]
    Demo(DemoCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let settings = ChatflowConfig::load(cli.config.clone()).context("loading configuration")?;
    settings.validate().context("validating configuration")?;

    match cli.command {
        Commands::Run(command) => command.execute(settings, shutdown_token()).await,
        Commands::Send(command) => command.execute(&settings).await,
        Commands::Block(command) => command.execute(&settings).await,
        Commands::Ban(command) => command.execute(&settings).await,
        Commands::Demo(command) => command.execute(settings).await,
    }
}

/// Token cancelled on the first Ctrl-C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, shutting down"),
        }
        cancel.cancel();
    });
    token
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
