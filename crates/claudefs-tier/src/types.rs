use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{TierError, TierResult};

/// Default fixed capacity of a service rank list.
pub const DEFAULT_RANK_CAPACITY: usize = 8;

/// Identifies a storage pool across the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(Uuid);

impl PoolId {
    /// Wraps an existing UUID.
    pub fn new(id: Uuid) -> Self {
        PoolId(id)
    }

    /// Generates a random pool ID.
    pub fn generate() -> Self {
        PoolId(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a server rank within a process group
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankId(u32);

impl RankId {
    /// Creates a new RankId from a raw u32 value
    pub fn new(id: u32) -> Self {
        RankId(id)
    }

    /// Returns the raw u32 value of this rank
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which neighbor slot a piece of tier state belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierRole {
    /// The tier this process serves.
    This,
    /// The neighbor one step warmer.
    Warmer,
    /// The neighbor one step colder.
    Colder,
}

impl TierRole {
    /// All roles, in slot order.
    pub const ALL: [TierRole; 3] = [TierRole::This, TierRole::Warmer, TierRole::Colder];

    /// Wire tag used in handle broadcasts.
    pub fn tag(self) -> u8 {
        match self {
            TierRole::This => 0,
            TierRole::Warmer => 1,
            TierRole::Colder => 2,
        }
    }

    /// Decodes a wire tag.
    pub fn from_tag(tag: u8) -> TierResult<Self> {
        match tag {
            0 => Ok(TierRole::This),
            1 => Ok(TierRole::Warmer),
            2 => Ok(TierRole::Colder),
            other => Err(TierError::InvalidRoleTag(other)),
        }
    }
}

/// Label used in logs and errors for an optional group name.
pub fn group_label(group: Option<&str>) -> &str {
    group.unwrap_or("default")
}

/// Identity of a tier: its pool and the server group hosting it.
///
/// A `None` group refers to the default server group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TierIdentity {
    /// Pool UUID.
    pub pool_id: PoolId,
    /// Server group name, `None` for the default group.
    pub group: Option<String>,
}

impl TierIdentity {
    /// Creates a new identity.
    pub fn new(pool_id: PoolId, group: Option<String>) -> Self {
        Self { pool_id, group }
    }

    /// Group name as shown in logs.
    pub fn group_label(&self) -> &str {
        group_label(self.group.as_deref())
    }
}

impl fmt::Display for TierIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_label(), self.pool_id)
    }
}

/// Ordered service rank list with a fixed capacity.
///
/// Built once through [`RankList::sequential`], which rejects counts above
/// capacity instead of truncating. A deferred list is unresolved because the
/// group size was not known yet; a resolved list may still be empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankList {
    ranks: Vec<RankId>,
    capacity: usize,
    resolved: bool,
}

impl RankList {
    /// Empty list awaiting resolution.
    pub fn deferred(capacity: usize) -> Self {
        Self {
            ranks: Vec::new(),
            capacity,
            resolved: false,
        }
    }

    /// Ranks `0..count`, validated against `capacity`.
    pub fn sequential(count: u32, capacity: usize) -> TierResult<Self> {
        if count as usize > capacity {
            return Err(TierError::Configuration {
                reason: format!(
                    "group of {} ranks exceeds rank list capacity {}",
                    count, capacity
                ),
            });
        }
        Ok(Self {
            ranks: (0..count).map(RankId::new).collect(),
            capacity,
            resolved: true,
        })
    }

    /// Ranks `0..capacity`, used when group membership is unknown.
    pub fn placeholder(capacity: usize) -> Self {
        Self {
            ranks: (0..capacity as u32).map(RankId::new).collect(),
            capacity,
            resolved: true,
        }
    }

    /// Ranks in order.
    pub fn ranks(&self) -> &[RankId] {
        &self.ranks
    }

    /// Number of ranks.
    pub fn count(&self) -> usize {
        self.ranks.len()
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when resolution was deferred.
    pub fn is_deferred(&self) -> bool {
        !self.resolved
    }
}

/// Access mode requested when opening a pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    #[default]
    ReadWrite,
    /// Exclusive access.
    Exclusive,
}

/// Pool information returned by a successful connect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Pool UUID.
    pub pool_id: PoolId,
    /// Number of storage targets in the pool.
    pub target_count: u32,
    /// Current pool service leader.
    pub leader: RankId,
    /// Pool map version at connect time.
    pub map_version: u32,
}

/// Open connection to a pool, valid only on the rank that holds it.
///
/// Handles are not `Clone`: sharing one with another rank goes
/// through [`crate::handle::marshal`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolHandle {
    pool_id: PoolId,
    group: Option<String>,
    mode: ConnectMode,
    session: Uuid,
    owner: RankId,
}

impl PoolHandle {
    /// Creates a handle for a session opened by `owner`.
    pub fn new(
        pool_id: PoolId,
        group: Option<String>,
        mode: ConnectMode,
        session: Uuid,
        owner: RankId,
    ) -> Self {
        Self {
            pool_id,
            group,
            mode,
            session,
            owner,
        }
    }

    /// Pool this handle is connected to.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Group hosting the pool.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Access mode of the connection.
    pub fn mode(&self) -> ConnectMode {
        self.mode
    }

    /// Pool service session the handle refers to.
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Rank on which this handle is valid.
    pub fn owner(&self) -> RankId {
        self.owner
    }
}

/// Attached or looked-up process group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    name: Option<String>,
}

impl GroupHandle {
    /// Creates a handle for the named group (`None` for the default group).
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }

    /// Group name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tag_roundtrip() {
        for role in TierRole::ALL {
            assert_eq!(TierRole::from_tag(role.tag()).unwrap(), role);
        }
        assert!(matches!(
            TierRole::from_tag(7),
            Err(TierError::InvalidRoleTag(7))
        ));
    }

    #[test]
    fn test_rank_list_sequential() {
        let list = RankList::sequential(3, 8).unwrap();
        assert_eq!(list.count(), 3);
        assert_eq!(list.ranks(), &[RankId::new(0), RankId::new(1), RankId::new(2)]);
        assert!(!list.is_deferred());
    }

    #[test]
    fn test_rank_list_rejects_overflow() {
        let result = RankList::sequential(9, 8);
        assert!(matches!(result, Err(TierError::Configuration { .. })));
    }

    #[test]
    fn test_rank_list_at_capacity() {
        let list = RankList::sequential(8, 8).unwrap();
        assert_eq!(list.count(), list.capacity());
    }

    #[test]
    fn test_rank_list_placeholder_and_deferred() {
        assert_eq!(RankList::placeholder(4).count(), 4);
        assert!(RankList::deferred(4).is_deferred());
    }

    #[test]
    fn test_empty_group_is_resolved_not_deferred() {
        let list = RankList::sequential(0, 8).unwrap();
        assert_eq!(list.count(), 0);
        assert!(!list.is_deferred());
        assert_ne!(list, RankList::deferred(8));
    }

    #[test]
    fn test_identity_display_default_group() {
        let id = TierIdentity::new(PoolId::generate(), None);
        assert!(format!("{}", id).starts_with("default:"));
    }
}
