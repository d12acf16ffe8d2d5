#![warn(missing_docs)]

//! `cfs-tier`: tier configuration check and in-process cross-connection simulation.

use anyhow::Result;
use clap::Parser;
use claudefs_tier::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ClaudeFS tier tool starting...");

    Cli::parse().run().await
}
