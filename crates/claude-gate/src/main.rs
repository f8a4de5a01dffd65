//! Claude Gate - OAuth proxy for the Anthropic API
//!
//! Main entry point for the claude-gate CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{auth, start, storage};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Claude Gate - use a Claude Pro/Max subscription with any Anthropic API client
#[derive(Parser)]
#[command(name = "claude-gate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Start(start::StartArgs),

    /// Authentication management
    Auth(auth::AuthArgs),

    /// Token storage management
    Storage(storage::StorageArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable, RUST_LOG wins) + rotating JSON file
    let filter = if cli.verbose {
        "claude_gate=debug,claude_gate_oauth=debug,claude_gate_storage=debug,claude_gate_config=debug,info"
    } else {
        "claude_gate=info,claude_gate_oauth=info,claude_gate_storage=info,claude_gate_config=info,warn"
    };
    let console_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| tracing_subscriber::EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(filter));

    let log_dir = claude_gate_config::config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "claude-gate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "claude_gate=trace,claude_gate_oauth=trace,claude_gate_storage=trace,claude_gate_config=trace,info",
                )),
        )
        .init();

    let loaded = claude_gate_config::load_config(None)?;
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    let ctx = commands::Context {
        config: loaded.config,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Start(args) => start::run(args, &ctx).await,
        Commands::Auth(args) => auth::run(args, &ctx).await,
        Commands::Storage(args) => storage::run(args, &ctx).await,
    }
}
