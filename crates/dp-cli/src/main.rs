mod commands;
mod config;
mod util;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "dpsess", about = "Inspect and maintain cached transformation sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(long, global = true, env = "DP_CONFIG")]
    config: Option<PathBuf>,

    /// Key namespace the sessions live under
    #[arg(long, global = true, env = "DP_SCOPE")]
    scope: Option<String>,

    /// Redis connection string, e.g. redis://127.0.0.1:6379
    #[arg(long, global = true, env = "DP_REDIS_URL")]
    redis_url: Option<String>,
}

#[derive(Args)]
struct SessionArgs {
    /// User identifier
    #[arg(long)]
    user: String,
    /// Dataset identifier
    #[arg(long)]
    dataset: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the state of one session as JSON
    Info {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Show the operation history of one session
    History {
        #[command(flatten)]
        session: SessionArgs,
        /// Maximum number of entries
        #[arg(short, default_value = "20")]
        n: usize,
    },

    /// Delete every key of one session
    Clear {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// List the sessions stored under the scope
    List,

    /// Purge every expired session under the scope
    Sweep,

    /// Decode a raw payload file
    Decode {
        /// File holding the payload bytes
        file: PathBuf,
        /// Decode as a metadata map instead of a dataset
        #[arg(long)]
        metadata: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dp=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_overrides(cli.scope, cli.redis_url);

    match cli.command {
        Commands::Info { session } => {
            commands::info::run(&settings, &session.user, &session.dataset).await
        }
        Commands::History { session, n } => {
            commands::history::run(&settings, &session.user, &session.dataset, n).await
        }
        Commands::Clear { session } => {
            commands::clear::run(&settings, &session.user, &session.dataset).await
        }
        Commands::List => commands::list::run(&settings).await,
        Commands::Sweep => commands::sweep::run(&settings).await,
        Commands::Decode { file, metadata } => commands::decode::run(&settings, &file, metadata),
        Commands::Config => commands::config::run(&settings),
    }
}
