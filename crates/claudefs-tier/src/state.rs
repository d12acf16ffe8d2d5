//! Per-process record of this tier and its warmer and colder neighbors.
//!
//! Each role has its own lock. Status queries take shared access while
//! registration and handle installs take exclusive access, so concurrent
//! handlers cannot interleave a half-written identity with its rank list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{TierError, TierResult};
use crate::types::{PoolHandle, RankList, TierIdentity, TierRole};

/// Snapshot of one role's connection record.
#[derive(Clone, Debug)]
pub struct TierConnection {
    /// Registered identity, fixed once set.
    pub identity: Option<TierIdentity>,
    /// Service ranks used to connect.
    pub ranks: RankList,
    /// Installed handle, if any.
    pub handle: Option<Arc<PoolHandle>>,
    /// True iff `handle` was installed.
    pub connected: bool,
}

impl TierConnection {
    fn empty(capacity: usize) -> Self {
        Self {
            identity: None,
            ranks: RankList::deferred(capacity),
            handle: None,
            connected: false,
        }
    }
}

struct TierSlot {
    record: RwLock<TierConnection>,
    connecting: AtomicBool,
}

impl TierSlot {
    fn new(capacity: usize) -> Self {
        Self {
            record: RwLock::new(TierConnection::empty(capacity)),
            connecting: AtomicBool::new(false),
        }
    }
}

/// Marks a connect for one role as in flight; cleared on drop.
pub struct ConnectGuard<'a> {
    slot: &'a TierSlot,
    role: TierRole,
}

impl ConnectGuard<'_> {
    /// Role being connected.
    pub fn role(&self) -> TierRole {
        self.role
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.slot.connecting.store(false, Ordering::Release);
        debug!(role = ?self.role, "connect slot released");
    }
}

/// Serializable per-role status for status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    /// Registered identity.
    pub identity: Option<TierIdentity>,
    /// Number of service ranks known.
    pub rank_count: usize,
    /// Whether a handle is installed.
    pub connected: bool,
}

/// Serializable status of all three roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStatus {
    /// This tier.
    pub this: RoleStatus,
    /// Warmer neighbor.
    pub warmer: RoleStatus,
    /// Colder neighbor.
    pub colder: RoleStatus,
}

/// Tier state owned by one service instance.
pub struct TierState {
    this: TierSlot,
    warmer: TierSlot,
    colder: TierSlot,
    rank_capacity: usize,
}

impl TierState {
    /// Creates empty state with the given rank list capacity.
    pub fn new(rank_capacity: usize) -> Self {
        Self {
            this: TierSlot::new(rank_capacity),
            warmer: TierSlot::new(rank_capacity),
            colder: TierSlot::new(rank_capacity),
            rank_capacity,
        }
    }

    /// Rank list capacity for every role.
    pub fn rank_capacity(&self) -> usize {
        self.rank_capacity
    }

    fn slot(&self, role: TierRole) -> &TierSlot {
        match role {
            TierRole::This => &self.this,
            TierRole::Warmer => &self.warmer,
            TierRole::Colder => &self.colder,
        }
    }

    /// Sets identity and ranks if the role has none; first writer wins.
    pub fn register_identity(
        &self,
        role: TierRole,
        identity: TierIdentity,
        ranks: RankList,
    ) -> TierResult<()> {
        let mut record = self.slot(role).record.write();
        if let Some(existing) = &record.identity {
            return Err(TierError::AlreadyRegistered {
                role,
                pool: existing.to_string(),
            });
        }
        info!(role = ?role, identity = %identity, ranks = ranks.count(), "registered tier identity");
        record.identity = Some(identity);
        record.ranks = ranks;
        Ok(())
    }

    /// Replaces a deferred rank list once the group size becomes known.
    pub fn resolve_ranks(&self, role: TierRole, ranks: RankList) {
        let mut record = self.slot(role).record.write();
        if record.ranks.is_deferred() {
            debug!(role = ?role, ranks = ranks.count(), "resolved deferred rank list");
            record.ranks = ranks;
        }
    }

    /// Snapshot of the role's record.
    pub fn get(&self, role: TierRole) -> TierConnection {
        self.slot(role).record.read().clone()
    }

    /// Registered identity for the role.
    pub fn identity(&self, role: TierRole) -> Option<TierIdentity> {
        self.slot(role).record.read().identity.clone()
    }

    /// Installs a handle and marks the role connected, replacing any previous one.
    pub fn set_handle(&self, role: TierRole, handle: PoolHandle) {
        let mut record = self.slot(role).record.write();
        if record.handle.is_some() {
            debug!(role = ?role, "replacing installed pool handle");
        }
        record.handle = Some(Arc::new(handle));
        record.connected = true;
    }

    /// Whether the role has an installed handle.
    pub fn is_connected(&self, role: TierRole) -> bool {
        self.slot(role).record.read().connected
    }

    /// Claims the role's connect slot, failing if another connect is in flight.
    pub fn begin_connect(&self, role: TierRole) -> TierResult<ConnectGuard<'_>> {
        let slot = self.slot(role);
        if slot
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TierError::ConnectInProgress { role });
        }
        Ok(ConnectGuard { slot, role })
    }

    fn role_status(&self, role: TierRole) -> RoleStatus {
        let record = self.slot(role).record.read();
        RoleStatus {
            identity: record.identity.clone(),
            rank_count: record.ranks.count(),
            connected: record.connected,
        }
    }

    /// Status of all roles.
    pub fn status(&self) -> TierStatus {
        TierStatus {
            this: self.role_status(TierRole::This),
            warmer: self.role_status(TierRole::Warmer),
            colder: self.role_status(TierRole::Colder),
        }
    }
}
