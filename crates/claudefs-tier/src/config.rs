//! Tier service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TierError, TierResult};
use crate::types::{ConnectMode, DEFAULT_RANK_CAPACITY};

/// Configuration for one tier service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Rank the service runs on.
    pub local_rank: u32,
    /// Maximum service ranks per tier.
    pub rank_capacity: usize,
    /// Mode used for every pool connect.
    pub connect_mode: ConnectMode,
    /// Wait for a pool connect completion.
    pub connect_timeout_ms: u64,
    /// Wait for an aggregate handle broadcast.
    pub broadcast_timeout_ms: u64,
    /// Wait for the colder tier's upstream connect reply.
    pub upstream_timeout_ms: u64,
    /// Storage device configuration to build the access policy from.
    pub device_config: Option<PathBuf>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            local_rank: 0,
            rank_capacity: DEFAULT_RANK_CAPACITY,
            connect_mode: ConnectMode::ReadWrite,
            connect_timeout_ms: 30_000,
            broadcast_timeout_ms: 10_000,
            upstream_timeout_ms: 60_000,
            device_config: None,
        }
    }
}

impl TierConfig {
    /// Loads a `.toml` or `.json` config file and validates it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TierConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero capacity and zero timeouts.
    pub fn validate(&self) -> TierResult<()> {
        if self.rank_capacity == 0 {
            return Err(TierError::Configuration {
                reason: "rank_capacity must be at least 1".to_string(),
            });
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("broadcast_timeout_ms", self.broadcast_timeout_ms),
            ("upstream_timeout_ms", self.upstream_timeout_ms),
        ] {
            if value == 0 {
                return Err(TierError::Configuration {
                    reason: format!("{} must be non-zero", name),
                });
            }
        }
        Ok(())
    }
}
