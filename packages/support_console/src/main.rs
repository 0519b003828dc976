use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod render;

use crate::config::{ConsoleConfig, RuntimeOverrides};

#[derive(Parser)]
#[command(name = "support-agent")]
#[command(about = "Agent console for support chat conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.support-agent)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file to use instead of <data-dir>/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent identity (overrides agent.owner_id)
    #[arg(long, global = true)]
    owner_id: Option<String>,

    /// Name shown to customers (overrides agent.display_name)
    #[arg(long, global = true)]
    display_name: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the agent's conversations
    List(ListArgs),

    /// Open the interactive chat console
    Chat(ChatArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ChatArgs {
    /// Conversation to open right away
    #[arg(long)]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the console output; logs go to stderr.
    let default_directive = if cli.debug {
        "support_agent=debug,support_sync=debug,info"
    } else {
        "support_agent=info,support_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let console = ConsoleConfig::new(cli.data_dir.clone())?;
    let overrides = RuntimeOverrides {
        owner_id: cli.owner_id.clone(),
        display_name: cli.display_name.clone(),
    };
    let sync_config = console.sync_config(cli.config.as_deref(), &overrides)?;
    debug!(owner_id = %sync_config.agent.owner_id, "Configuration loaded");

    match cli.command {
        Commands::List(args) => cli::list_command(&sync_config, args.json).await,
        Commands::Chat(args) => cli::chat_command(sync_config, args.conversation).await,
        Commands::Config => cli::config_command(&sync_config),
    }
}
