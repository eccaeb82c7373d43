//! Sessionkeeper CLI
//!
//! Signs in against an API server and issues authenticated calls that survive
//! access-token expiry.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use commands::Commands;

#[derive(Parser)]
#[command(name = "sessionkeeper")]
#[command(about = "Authenticated API client with coordinated token refresh")]
#[command(version)]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "SESSIONKEEPER_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessionkeeper=debug".parse()?)
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!("Starting sessionkeeper v{}", sessionkeeper_core::VERSION);

    cli.command.execute(cli.db).await
}
