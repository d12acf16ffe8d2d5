//! Process group membership as seen by the tier protocol.

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::error::TierResult;
use crate::types::{group_label, GroupHandle, RankList};

/// Group membership collaborator provided by the RPC transport layer.
#[async_trait]
pub trait GroupDirectory: Send + Sync + 'static {
    /// Looks up a group this process already knows about.
    fn lookup(&self, name: Option<&str>) -> Option<GroupHandle>;

    /// Number of ranks in the group.
    fn group_size(&self, group: &GroupHandle) -> TierResult<u32>;

    /// Attaches to a remote group so requests can be addressed to it.
    async fn attach(&self, name: Option<&str>) -> TierResult<GroupHandle>;
}

/// Outcome of a best-effort rank list resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankResolution {
    /// Group found and sized.
    Resolved(RankList),
    /// Group unknown or its size could not be queried.
    Unresolved,
}

impl RankResolution {
    /// The resolved list, or `fallback` if unresolved.
    pub fn unwrap_or(self, fallback: RankList) -> RankList {
        match self {
            RankResolution::Resolved(list) => list,
            RankResolution::Unresolved => fallback,
        }
    }
}

/// Resolves a group's rank list from its size.
///
/// Lookup and size failures are logged and yield `Unresolved`. A group larger
/// than `capacity` is a configuration error.
pub fn resolve_ranks(
    directory: &dyn GroupDirectory,
    name: Option<&str>,
    capacity: usize,
) -> TierResult<RankResolution> {
    let Some(group) = directory.lookup(name) else {
        debug!(group = group_label(name), "failed to look up group");
        return Ok(RankResolution::Unresolved);
    };

    let size = match directory.group_size(&group) {
        Ok(size) => size,
        Err(e) => {
            error!(group = group_label(name), error = %e, "group size query failed");
            return Ok(RankResolution::Unresolved);
        }
    };

    let list = RankList::sequential(size, capacity)?;
    info!(group = group_label(name), ranks = size, "resolved group rank list");
    Ok(RankResolution::Resolved(list))
}
