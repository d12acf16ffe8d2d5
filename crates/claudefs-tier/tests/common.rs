//! Common test utilities and fixtures for integration tests.

use claudefs_tier::sim::SimCluster;
use claudefs_tier::{TierConfig, TierRole, TierState};

/// Config with short timeouts for fast testing
pub fn fast_config() -> TierConfig {
    TierConfig {
        connect_timeout_ms: 2_000,
        broadcast_timeout_ms: 2_000,
        upstream_timeout_ms: 5_000,
        ..TierConfig::default()
    }
}

/// Builds a cluster with one tier per `(group, members)` entry, warmest first.
pub fn cluster(tiers: &[(&str, u32)]) -> SimCluster {
    cluster_with(fast_config(), tiers)
}

/// Like [`cluster`], with an explicit config.
pub fn cluster_with(config: TierConfig, tiers: &[(&str, u32)]) -> SimCluster {
    let mut cluster = SimCluster::new(config);
    for (group, members) in tiers {
        cluster.add_tier(group, *members);
    }
    cluster
}

/// Which roles are connected on `state`, in `This, Warmer, Colder` order.
pub fn connected(state: &TierState) -> [bool; 3] {
    [
        state.is_connected(TierRole::This),
        state.is_connected(TierRole::Warmer),
        state.is_connected(TierRole::Colder),
    ]
}
