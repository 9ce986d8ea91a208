use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rewind::config::{BackendKind, LoggingConfig};
use rewind::{Rewind, RewindConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "rewind")]
#[command(about = "Rewind CLI - inspect and maintain response caches")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "REWIND_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Override the configured cache directory
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    File,
    Sqlite,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show per-type cache statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete cached responses
    Clear {
        /// Only clear responses of this type
        #[arg(long = "type")]
        type_name: Option<String>,

        /// Only clear stale responses
        #[arg(long)]
        stale_only: bool,
    },

    /// Delete every stale response and leftover partial writes
    EvictExpired,
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".rewind").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("rewind.toml"))
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = RewindConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.logging);

    if let Some(backend) = cli.backend {
        config.persistence.backend = match backend {
            Backend::File => BackendKind::File,
            Backend::Sqlite => BackendKind::Sqlite,
        };
    }
    if let Some(path) = cli.path {
        config.persistence.path = rewind::config::expand_tilde(&path)?;
    }
    if config.persistence.backend == BackendKind::Memory {
        tracing::warn!("Memory backend selected; there is nothing persisted to inspect");
    }

    let rewind = Rewind::builder(config)
        .build()
        .context("Failed to open cache")?;

    match cli.command {
        Commands::Stats { json } => commands::run_stats(&rewind, json).await?,
        Commands::Clear {
            type_name,
            stale_only,
        } => commands::run_clear(&rewind, type_name.as_deref(), stale_only).await?,
        Commands::EvictExpired => commands::run_evict_expired(&rewind).await?,
    }

    Ok(())
}
