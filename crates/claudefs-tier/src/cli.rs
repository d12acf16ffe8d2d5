//! Command-line interface for `cfs-tier`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::TierConfig;
use crate::device_policy::DeviceAccessPolicy;
use crate::error::ResultCode;
use crate::sim::SimCluster;
use crate::state::TierStatus;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "cfs-tier")]
#[command(about = "ClaudeFS tier cross-connection tool", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Load and validate a tier config, printing the device allow-list.
    CheckConfig {
        /// `.toml` or `.json` config file.
        path: PathBuf,
    },
    /// Link an in-process tier hierarchy and print every tier's status.
    Simulate {
        /// Number of tiers, warmest first.
        #[arg(short, long, default_value = "3", env = "CFS_TIER_COUNT")]
        tiers: usize,
        /// Ranks per tier.
        #[arg(short, long, default_value = "4")]
        members: u32,
        /// Optional config shared by every simulated service.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SimulatedTier {
    group: String,
    cross_connect: i32,
    status: TierStatus,
}

impl Cli {
    /// Runs the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::CheckConfig { ref path } => check_config(path),
            Command::Simulate {
                tiers,
                members,
                ref config,
            } => simulate(tiers, members, config.as_deref()).await,
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = TierConfig::from_file(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    if let Some(device_config) = &config.device_config {
        let policy = DeviceAccessPolicy::from_file(device_config)?;
        println!("VMD enabled: {}", policy.vmd_enabled());
        for addr in policy.allowed() {
            println!("  allow {}", addr);
        }
    }
    Ok(())
}

async fn simulate(tiers: usize, members: u32, config: Option<&Path>) -> Result<()> {
    if tiers == 0 || members == 0 {
        anyhow::bail!("simulate needs at least one tier and one member");
    }
    let config = match config {
        Some(path) => TierConfig::from_file(path)?,
        None => TierConfig::default(),
    };

    let mut cluster = SimCluster::new(config);
    for index in 0..tiers {
        cluster.add_tier(&format!("tier{}", index), members);
    }

    let codes: Vec<ResultCode> = cluster.link_chain().await;
    let report: Vec<SimulatedTier> = cluster
        .status()
        .into_iter()
        .zip(codes)
        .map(|((group, status), code)| SimulatedTier {
            group,
            cross_connect: code.as_i32(),
            status,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
