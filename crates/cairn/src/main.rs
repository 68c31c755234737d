//! Cairn - session affinity and lifecycle engine tools
//!
//! Main entry point for the Cairn CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, id, simulate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Cairn - session affinity and lifecycle engine tools
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// User config directory (default: platform config dir)
    #[arg(long, global = true, env = "CAIRN_CONFIG_DIR", value_name = "DIR")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Configuration management
    Config(config::ConfigArgs),

    /// Encode and decode session tokens
    Id(id::IdArgs),

    /// Drive a cluster of session managers with simulated traffic
    Simulate(simulate::SimulateArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::prelude::*;

    let cli = Cli::parse();

    let loaded = cairn_config::load_config_with_options(None, cli.config.as_deref())?;
    let logging = loaded.config.logging();

    // Console (human-readable, stderr) + optional daily JSON file
    let filter = if cli.verbose {
        "cairn=debug,cairn_session=debug,cairn_config=debug,info".to_string()
    } else {
        let level = &logging.level;
        format!("cairn={level},cairn_session={level},cairn_config={level},warn")
    };

    let (file_layer, _guard) = match logging.directory {
        Some(ref dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "cairn.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "cairn=trace,cairn_session=trace,cairn_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_layer)
        .init();

    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_dir: cli.config,
        loaded,
    };

    match cli.command {
        Commands::Config(args) => config::run(args, &ctx).await,
        Commands::Id(args) => id::run(args, &ctx).await,
        Commands::Simulate(args) => simulate::run(args, &ctx).await,
    }
}
