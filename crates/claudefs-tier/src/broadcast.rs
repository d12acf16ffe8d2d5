//! Pool handle broadcast to every member of a pool's server group.
//!
//! The sender marshals the handle once and fans it out; each member
//! reconstitutes its own copy and installs it under the tagged role. The
//! aggregate succeeds only if every member acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ResultCode, TierError, TierResult};
use crate::handle::{self, MarshalledHandle};
use crate::rpc::{TierMessenger, TierRequest};
use crate::state::TierState;
use crate::types::{PoolHandle, PoolId, RankId, TierRole};

/// Summary of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Pool whose group received the handle.
    pub pool_id: PoolId,
    /// Role the handle was installed under.
    pub role: TierRole,
    /// Members addressed.
    pub total_members: usize,
    /// Members that installed the handle.
    pub acknowledged: usize,
}

/// Sends marshalled pool handles through a [`TierMessenger`].
pub struct HandleBroadcaster {
    messenger: Arc<dyn TierMessenger>,
    timeout: Duration,
}

impl HandleBroadcaster {
    /// Creates a broadcaster that waits at most `timeout` for the aggregate reply.
    pub fn new(messenger: Arc<dyn TierMessenger>, timeout: Duration) -> Self {
        Self { messenger, timeout }
    }

    /// Broadcasts `handle` tagged `role` to the group serving `target_pool_id`.
    ///
    /// The handle is consumed: after this call the only live copies are the
    /// ones members reconstituted.
    pub async fn broadcast_handle(
        &self,
        target_pool_id: PoolId,
        role: TierRole,
        handle: PoolHandle,
    ) -> TierResult<BroadcastSummary> {
        let marshalled = handle::marshal(handle)?;
        let request = TierRequest::HandleBroadcast {
            role_tag: role.tag(),
            handle: marshalled,
        };

        let timeout_ms = self.timeout.as_millis() as u64;
        let replies = match tokio::time::timeout(
            self.timeout,
            self.messenger.broadcast(target_pool_id, request),
        )
        .await
        {
            Ok(Ok(replies)) => replies,
            Ok(Err(e)) => {
                error!(pool = %target_pool_id, role = ?role, error = %e, "handle broadcast send failed");
                return Err(e);
            }
            Err(_) => {
                error!(pool = %target_pool_id, role = ?role, timeout_ms, "handle broadcast timed out");
                return Err(TierError::Timeout {
                    operation: "handle broadcast",
                    timeout_ms,
                });
            }
        };

        let total_members = replies.len();
        let mut failed_ranks: Vec<RankId> = replies
            .iter()
            .filter(|r| !r.code.is_ok())
            .map(|r| r.rank)
            .collect();
        failed_ranks.sort();

        for reply in replies.iter().filter(|r| !r.code.is_ok()) {
            warn!(pool = %target_pool_id, rank = %reply.rank, code = %reply.code, "member rejected broadcast handle");
        }

        if total_members == 0 || !failed_ranks.is_empty() {
            error!(
                pool = %target_pool_id,
                role = ?role,
                total_members,
                failed = failed_ranks.len(),
                "handle broadcast incomplete"
            );
            return Err(TierError::HandleBroadcast {
                failed_ranks,
                total_members,
            });
        }

        debug!(pool = %target_pool_id, role = ?role, total_members, "pool handle broadcast acknowledged");
        Ok(BroadcastSummary {
            pool_id: target_pool_id,
            role,
            total_members,
            acknowledged: total_members,
        })
    }
}

/// Installs a received broadcast handle; the receiving side of a broadcast.
///
/// Unknown tags are rejected before the handle is touched, so no state is
/// mutated for them.
pub fn install_broadcast_handle(
    state: &TierState,
    local_rank: RankId,
    role_tag: u8,
    marshalled: MarshalledHandle,
) -> ResultCode {
    let role = match TierRole::from_tag(role_tag) {
        Ok(role) => role,
        Err(e) => {
            warn!(rank = %local_rank, role_tag, error = %e, "rejecting broadcast handle");
            return ResultCode::from(e);
        }
    };

    match handle::unmarshal(marshalled, local_rank) {
        Ok(local) => {
            info!(rank = %local_rank, role = ?role, pool = %local.pool_id(), "installing inter-tier pool handle");
            state.set_handle(role, local);
            ResultCode::Ok
        }
        Err(e) => {
            error!(rank = %local_rank, role = ?role, error = %e, "failed to reconstitute broadcast handle");
            ResultCode::from(e)
        }
    }
}
