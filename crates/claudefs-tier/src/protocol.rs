//! Tier cross-connection protocol.
//!
//! A warm tier that knows its colder neighbor connects to it, connects to
//! itself, broadcasts both handles to its own group, and then asks the colder
//! tier to connect back upstream. Each step runs only after the previous
//! step's broadcast or reply was acknowledged.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broadcast::{install_broadcast_handle, HandleBroadcaster};
use crate::config::TierConfig;
use crate::connect::{ConnectAdapter, PoolConnector};
use crate::error::{ResultCode, TierError, TierResult};
use crate::group::{resolve_ranks, GroupDirectory, RankResolution};
use crate::handle::MarshalledHandle;
use crate::rpc::{Endpoint, TierMessenger, TierRequest};
use crate::state::TierState;
use crate::types::{
    group_label, ConnectMode, PoolId, RankId, RankList, TierIdentity, TierRole,
};

/// Phases of one cross-connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossConnectPhase {
    /// Nothing attempted yet.
    Idle,
    /// A colder identity is registered and not yet connected.
    ColderRegistered,
    /// Opening the colder pool.
    DownstreamConnecting,
    /// Broadcasting the colder handle to this tier's group.
    DownstreamBroadcast,
    /// Opening this tier's own pool.
    LocalConnecting,
    /// Broadcasting this tier's handle to its group.
    LocalBroadcast,
    /// Asking the colder tier to connect back.
    UpstreamTriggering,
    /// All steps succeeded.
    Complete,
    /// The attempt stopped with the given code.
    Failed(ResultCode),
}

/// How much of the tier linkage one attempt established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    /// Nothing was established.
    Unlinked,
    /// Some links exist; no rollback is attempted.
    PartiallyLinked,
    /// Downstream, local, and upstream links all exist.
    Linked,
}

/// Outcome of a cross-connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossConnectReport {
    /// Reply code sent to the caller.
    pub code: ResultCode,
    /// Phases visited, in order.
    pub phases: Vec<CrossConnectPhase>,
    /// Linkage established.
    pub linkage: Linkage,
    /// Code of the upstream step, if it ran.
    pub upstream_code: Option<ResultCode>,
}

struct StepFailure {
    code: ResultCode,
    error: TierError,
}

impl StepFailure {
    fn broadcast(error: TierError) -> Self {
        Self {
            code: ResultCode::HandleBroadcastError,
            error,
        }
    }
}

impl From<TierError> for StepFailure {
    fn from(error: TierError) -> Self {
        Self {
            code: ResultCode::from(&error),
            error,
        }
    }
}

struct CrossConnectRun {
    pool_id: PoolId,
    phases: Vec<CrossConnectPhase>,
    downstream_linked: bool,
    local_linked: bool,
    upstream_code: Option<ResultCode>,
}

impl CrossConnectRun {
    fn new(pool_id: PoolId) -> Self {
        Self {
            pool_id,
            phases: vec![CrossConnectPhase::Idle],
            downstream_linked: false,
            local_linked: false,
            upstream_code: None,
        }
    }

    fn advance(&mut self, next: CrossConnectPhase) {
        let from = self.phases.last().copied().unwrap_or(CrossConnectPhase::Idle);
        debug!(pool = %self.pool_id, from = ?from, to = ?next, "cross-connect phase");
        self.phases.push(next);
    }

    fn finish(mut self, result: Result<(), StepFailure>) -> CrossConnectReport {
        let code = match result {
            Ok(()) => {
                self.advance(CrossConnectPhase::Complete);
                ResultCode::Ok
            }
            Err(failure) => {
                if failure.code.is_protocol_state() {
                    info!(pool = %self.pool_id, code = %failure.code, reason = %failure.error, "cross-connect not attempted");
                } else {
                    error!(pool = %self.pool_id, code = %failure.code, error = %failure.error, "cross-connect failed");
                }
                self.advance(CrossConnectPhase::Failed(failure.code));
                failure.code
            }
        };

        let linkage = match (self.downstream_linked, self.local_linked, code.is_ok()) {
            (true, true, true) => Linkage::Linked,
            (false, false, _) => Linkage::Unlinked,
            _ => Linkage::PartiallyLinked,
        };

        CrossConnectReport {
            code,
            phases: self.phases,
            linkage,
            upstream_code: self.upstream_code,
        }
    }
}

/// External collaborators a [`TierService`] runs against.
pub struct TierCollaborators {
    /// Pool-connect operation.
    pub connector: Arc<dyn PoolConnector>,
    /// RPC transport.
    pub messenger: Arc<dyn TierMessenger>,
    /// Group membership.
    pub directory: Arc<dyn GroupDirectory>,
}

/// Tier protocol instance owned by one server rank.
pub struct TierService {
    local_rank: RankId,
    mode: ConnectMode,
    upstream_timeout: Duration,
    state: Arc<TierState>,
    connector: ConnectAdapter,
    broadcaster: HandleBroadcaster,
    messenger: Arc<dyn TierMessenger>,
    directory: Arc<dyn GroupDirectory>,
}

impl TierService {
    /// Creates a service with empty tier state.
    pub fn new(config: &TierConfig, collaborators: TierCollaborators) -> Self {
        Self::with_state(
            config,
            Arc::new(TierState::new(config.rank_capacity)),
            collaborators,
        )
    }

    /// Creates a service over existing tier state.
    pub fn with_state(
        config: &TierConfig,
        state: Arc<TierState>,
        collaborators: TierCollaborators,
    ) -> Self {
        Self {
            local_rank: RankId::new(config.local_rank),
            mode: config.connect_mode,
            upstream_timeout: Duration::from_millis(config.upstream_timeout_ms),
            state,
            connector: ConnectAdapter::new(
                collaborators.connector,
                Duration::from_millis(config.connect_timeout_ms),
            ),
            broadcaster: HandleBroadcaster::new(
                collaborators.messenger.clone(),
                Duration::from_millis(config.broadcast_timeout_ms),
            ),
            messenger: collaborators.messenger,
            directory: collaborators.directory,
        }
    }

    /// Rank this service runs on.
    pub fn local_rank(&self) -> RankId {
        self.local_rank
    }

    /// Tier state owned by this service.
    pub fn state(&self) -> &Arc<TierState> {
        &self.state
    }

    fn ranks_for(&self, role: TierRole, group: Option<&str>) -> TierResult<RankList> {
        let record = self.state.get(role);
        if !record.ranks.is_deferred() {
            return Ok(record.ranks);
        }
        let capacity = self.state.rank_capacity();
        match resolve_ranks(self.directory.as_ref(), group, capacity)? {
            RankResolution::Resolved(list) => {
                self.state.resolve_ranks(role, list.clone());
                Ok(list)
            }
            RankResolution::Unresolved => Ok(RankList::placeholder(capacity)),
        }
    }

    /// Registers `requested` for `role` if the role has no identity yet, then
    /// requires the registered identity to be `requested`.
    fn claim_identity(
        &self,
        role: TierRole,
        requested: &TierIdentity,
        ranks: impl FnOnce() -> TierResult<RankList>,
    ) -> TierResult<()> {
        if self.state.identity(role).is_none() {
            if let Err(e) = self.state.register_identity(role, requested.clone(), ranks()?) {
                debug!(role = ?role, error = %e, "tier identity registered concurrently");
            }
        }
        match self.state.identity(role) {
            Some(registered) if registered == *requested => Ok(()),
            registered => {
                let registered = registered.map(|i| i.to_string()).unwrap_or_default();
                warn!(role = ?role, registered = %registered, requested = %requested, "request names a different tier, rejecting");
                Err(TierError::IdentityMismatch {
                    role,
                    registered,
                    requested: requested.to_string(),
                })
            }
        }
    }

    /// Records the colder neighbor. A second registration is rejected with
    /// `ColdAlreadySet` and leaves the first one in place.
    pub fn register_colder(&self, colder_pool_id: PoolId, colder_group: Option<String>) -> ResultCode {
        if let Some(existing) = self.state.identity(TierRole::Colder) {
            warn!(existing = %existing, "colder group already set, ignoring colder tier set request");
            return ResultCode::ColdAlreadySet;
        }

        let capacity = self.state.rank_capacity();
        let ranks = match resolve_ranks(self.directory.as_ref(), colder_group.as_deref(), capacity) {
            Ok(resolution) => resolution.unwrap_or(RankList::deferred(capacity)),
            Err(e) => {
                error!(group = group_label(colder_group.as_deref()), error = %e, "rejecting colder registration");
                return ResultCode::from(e);
            }
        };

        let identity = TierIdentity::new(colder_pool_id, colder_group);
        match self.state.register_identity(TierRole::Colder, identity, ranks) {
            Ok(()) => {
                info!(rank = %self.local_rank, pool = %colder_pool_id, "registered colder tier");
                ResultCode::Ok
            }
            Err(e) => {
                warn!(error = %e, "colder tier registered concurrently, ignoring request");
                ResultCode::ColdAlreadySet
            }
        }
    }

    /// Runs the cross-connection on this (warm) tier.
    pub async fn cross_connect(&self, warm_pool_id: PoolId, warm_group: Option<String>) -> CrossConnectReport {
        let mut run = CrossConnectRun::new(warm_pool_id);
        let warm = TierIdentity::new(warm_pool_id, warm_group);
        let result = self.run_cross_connect(&mut run, &warm).await;
        run.finish(result)
    }

    async fn run_cross_connect(
        &self,
        run: &mut CrossConnectRun,
        warm: &TierIdentity,
    ) -> Result<(), StepFailure> {
        let colder = self.state.get(TierRole::Colder);
        let Some(cold) = colder.identity else {
            info!(tier = %warm, "no tier beneath current");
            return Err(TierError::NoColderTier.into());
        };
        if colder.connected {
            warn!(tier = %warm, colder = %cold, "downstream (colder) tier connection already made");
            return Err(TierError::AlreadyConnected {
                role: TierRole::Colder,
            }
            .into());
        }
        let capacity = self.state.rank_capacity();
        self.claim_identity(TierRole::This, warm, || {
            Ok(resolve_ranks(self.directory.as_ref(), warm.group.as_deref(), capacity)?
                .unwrap_or(RankList::placeholder(capacity)))
        })?;
        run.advance(CrossConnectPhase::ColderRegistered);

        self.link_downstream(run, warm, &cold).await?;
        run.downstream_linked = true;
        debug!(colder = %cold, "connected to colder tier");

        self.link_local(run, warm).await?;
        run.local_linked = true;
        debug!(tier = %warm, "connected to local tier");

        run.advance(CrossConnectPhase::UpstreamTriggering);
        let upstream_code = match self.trigger_upstream(warm, &cold).await {
            Ok(code) => code,
            Err(e) => {
                error!(colder = %cold, error = %e, "upstream trigger failed");
                ResultCode::from(e)
            }
        };
        run.upstream_code = Some(upstream_code);
        if !upstream_code.is_ok() {
            return Err(StepFailure::from(TierError::PartiallyLinked {
                upstream_code: upstream_code.as_i32(),
            }));
        }

        info!(tier = %warm, colder = %cold, "upstream connection (cold tier to local) complete");
        Ok(())
    }

    async fn link_downstream(
        &self,
        run: &mut CrossConnectRun,
        warm: &TierIdentity,
        cold: &TierIdentity,
    ) -> Result<(), StepFailure> {
        let _guard = self.state.begin_connect(TierRole::Colder)?;
        if self.state.is_connected(TierRole::Colder) {
            warn!(colder = %cold, "colder tier connected while waiting for the connect slot");
            return Err(TierError::AlreadyConnected {
                role: TierRole::Colder,
            }
            .into());
        }
        let ranks = self.ranks_for(TierRole::Colder, cold.group.as_deref())?;

        run.advance(CrossConnectPhase::DownstreamConnecting);
        let conn = self.connector.connect_pool(cold, &ranks, self.mode).await?;
        debug!(colder = %cold, targets = conn.info.target_count, "downstream connect complete");

        run.advance(CrossConnectPhase::DownstreamBroadcast);
        self.broadcaster
            .broadcast_handle(warm.pool_id, TierRole::Colder, conn.handle)
            .await
            .map_err(StepFailure::broadcast)?;
        Ok(())
    }

    async fn link_local(&self, run: &mut CrossConnectRun, warm: &TierIdentity) -> Result<(), StepFailure> {
        let _guard = self.state.begin_connect(TierRole::This)?;
        let ranks = self.ranks_for(TierRole::This, warm.group.as_deref())?;

        run.advance(CrossConnectPhase::LocalConnecting);
        let conn = self.connector.connect_pool(warm, &ranks, self.mode).await?;

        run.advance(CrossConnectPhase::LocalBroadcast);
        self.broadcaster
            .broadcast_handle(warm.pool_id, TierRole::This, conn.handle)
            .await
            .map_err(StepFailure::broadcast)?;
        Ok(())
    }

    async fn trigger_upstream(&self, warm: &TierIdentity, cold: &TierIdentity) -> TierResult<ResultCode> {
        let group = self.directory.attach(cold.group.as_deref()).await?;
        let target = Endpoint::new(group.name().map(str::to_string), RankId::new(0));
        let request = TierRequest::UpstreamConnect {
            warm_pool_id: warm.pool_id,
            warm_group: warm.group.clone(),
            cold_pool_id: cold.pool_id,
            cold_group: cold.group.clone(),
        };

        let timeout_ms = self.upstream_timeout.as_millis() as u64;
        let reply = tokio::time::timeout(self.upstream_timeout, self.messenger.send(&target, request))
            .await
            .map_err(|_| TierError::Timeout {
                operation: "upstream connect",
                timeout_ms,
            })??;
        debug!(colder = %cold, code = %reply.code, "upstream connect reply");
        Ok(reply.code)
    }

    /// Connects this (cold) tier back to its warmer neighbor and broadcasts
    /// the handle to the local group.
    pub async fn upstream_connect(
        &self,
        warm_pool_id: PoolId,
        warm_group: Option<String>,
        cold_pool_id: PoolId,
        cold_group: Option<String>,
    ) -> ResultCode {
        let warm = TierIdentity::new(warm_pool_id, warm_group);
        let cold = TierIdentity::new(cold_pool_id, cold_group);
        match self.run_upstream(&warm, &cold).await {
            Ok(()) => {
                info!(tier = %cold, warmer = %warm, "upstream connect to warmer pool complete");
                ResultCode::Ok
            }
            Err(failure) => {
                if failure.code.is_protocol_state() {
                    warn!(tier = %cold, warmer = %warm, code = %failure.code, reason = %failure.error, "upstream connect rejected");
                } else {
                    error!(tier = %cold, warmer = %warm, code = %failure.code, error = %failure.error, "upstream connect failed");
                }
                failure.code
            }
        }
    }

    async fn run_upstream(&self, warm: &TierIdentity, cold: &TierIdentity) -> Result<(), StepFailure> {
        let capacity = self.state.rank_capacity();
        self.claim_identity(TierRole::Warmer, warm, || {
            Ok(resolve_ranks(self.directory.as_ref(), warm.group.as_deref(), capacity)?
                .unwrap_or(RankList::placeholder(capacity)))
        })?;
        self.claim_identity(TierRole::This, cold, || Ok(RankList::deferred(capacity)))?;

        let _guard = self.state.begin_connect(TierRole::Warmer)?;
        let ranks = self.ranks_for(TierRole::Warmer, warm.group.as_deref())?;
        let conn = self.connector.connect_pool(warm, &ranks, self.mode).await?;
        debug!(warmer = %warm, leader = %conn.info.leader, "connected to warmer pool");

        self.broadcaster
            .broadcast_handle(cold.pool_id, TierRole::Warmer, conn.handle)
            .await
            .map_err(StepFailure::broadcast)?;
        Ok(())
    }

    /// Installs a handle received by broadcast.
    pub fn handle_broadcast(&self, role_tag: u8, handle: MarshalledHandle) -> ResultCode {
        install_broadcast_handle(&self.state, self.local_rank, role_tag, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;

    fn cluster(tiers: &[(&str, u32)]) -> SimCluster {
        let mut cluster = SimCluster::new(TierConfig {
            connect_timeout_ms: 2_000,
            broadcast_timeout_ms: 2_000,
            upstream_timeout_ms: 5_000,
            ..TierConfig::default()
        });
        for (group, members) in tiers {
            cluster.add_tier(group, *members);
        }
        cluster
    }

    #[tokio::test]
    async fn test_cross_connect_without_colder() {
        let cluster = cluster(&[("warm", 2)]);
        let warm = cluster.tier(0);
        let report = warm
            .service(0)
            .cross_connect(warm.pool_id, Some(warm.group.clone()))
            .await;

        assert_eq!(report.code, ResultCode::NoColderTier);
        assert_eq!(report.linkage, Linkage::Unlinked);
        assert_eq!(
            report.phases,
            vec![
                CrossConnectPhase::Idle,
                CrossConnectPhase::Failed(ResultCode::NoColderTier)
            ]
        );
        assert_eq!(cluster.fabric().connect_count(), 0);
    }

    #[tokio::test]
    async fn test_full_phase_sequence() {
        let cluster = cluster(&[("warm", 2), ("cold", 2)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        let service = warm.service(0);
        assert_eq!(
            service.register_colder(cold.pool_id, Some(cold.group.clone())),
            ResultCode::Ok
        );

        let report = service
            .cross_connect(warm.pool_id, Some(warm.group.clone()))
            .await;
        assert_eq!(report.code, ResultCode::Ok);
        assert_eq!(report.linkage, Linkage::Linked);
        assert_eq!(report.upstream_code, Some(ResultCode::Ok));
        assert_eq!(
            report.phases,
            vec![
                CrossConnectPhase::Idle,
                CrossConnectPhase::ColderRegistered,
                CrossConnectPhase::DownstreamConnecting,
                CrossConnectPhase::DownstreamBroadcast,
                CrossConnectPhase::LocalConnecting,
                CrossConnectPhase::LocalBroadcast,
                CrossConnectPhase::UpstreamTriggering,
                CrossConnectPhase::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_register_colder_defers_unknown_group() {
        let cluster = cluster(&[("warm", 1)]);
        let service = cluster.tier(0).service(0);
        let cold_pool = PoolId::generate();

        let code = service.register_colder(cold_pool, Some("later".to_string()));
        assert_eq!(code, ResultCode::Ok);
        let record = service.state().get(TierRole::Colder);
        assert!(record.ranks.is_deferred());
        assert_eq!(record.identity.map(|i| i.pool_id), Some(cold_pool));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let cluster = cluster(&[("warm", 1), ("cold", 1), ("archive", 1)]);
        let service = cluster.tier(0).service(0);
        let first = cluster.tier(1).identity();
        let second = cluster.tier(2).identity();

        assert_eq!(service.register_colder(first.pool_id, first.group.clone()), ResultCode::Ok);
        assert_eq!(
            service.register_colder(second.pool_id, second.group.clone()),
            ResultCode::ColdAlreadySet
        );
        assert_eq!(service.state().identity(TierRole::Colder), Some(first));
    }

    #[tokio::test]
    async fn test_downstream_connect_failure_leaves_nothing_linked() {
        let cluster = cluster(&[("warm", 2), ("cold", 2)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        cluster.fabric().fail_connect(cold.pool_id, -1026);
        let service = warm.service(0);
        service.register_colder(cold.pool_id, Some(cold.group.clone()));

        let report = service
            .cross_connect(warm.pool_id, Some(warm.group.clone()))
            .await;
        assert_eq!(report.code, ResultCode::Failed(-1026));
        assert_eq!(report.linkage, Linkage::Unlinked);
        assert!(cluster.fabric().broadcast_log().is_empty());
        assert_eq!(cluster.fabric().connect_log(), vec![cold.pool_id]);
        assert!(!service.state().is_connected(TierRole::Colder));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_partially_linked() {
        let cluster = cluster(&[("warm", 2), ("cold", 3)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        cluster
            .fabric()
            .fail_member(Some("cold"), RankId::new(2), -1013);
        let service = warm.service(0);
        service.register_colder(cold.pool_id, Some(cold.group.clone()));

        let report = service
            .cross_connect(warm.pool_id, Some(warm.group.clone()))
            .await;
        assert_eq!(report.code, ResultCode::PartiallyLinked);
        assert_eq!(report.linkage, Linkage::PartiallyLinked);
        assert_eq!(report.upstream_code, Some(ResultCode::HandleBroadcastError));
        assert!(service.state().is_connected(TierRole::Colder));
        assert!(service.state().is_connected(TierRole::This));
    }

    #[tokio::test]
    async fn test_concurrent_cross_connect_is_rejected() {
        let cluster = cluster(&[("warm", 1), ("cold", 1)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        cluster.fabric().set_connect_latency(Duration::from_millis(50));
        let service = warm.service(0);
        service.register_colder(cold.pool_id, Some(cold.group.clone()));

        let (first, second) = tokio::join!(
            service.cross_connect(warm.pool_id, Some(warm.group.clone())),
            service.cross_connect(warm.pool_id, Some(warm.group.clone())),
        );
        assert_eq!(first.code, ResultCode::Ok);
        assert_eq!(second.code, ResultCode::ConnectInProgress);
        assert_eq!(second.linkage, Linkage::Unlinked);
    }

    #[tokio::test]
    async fn test_upstream_connect_registers_warmer() {
        let cluster = cluster(&[("warm", 1), ("cold", 2)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        let service = cold.service(0);

        let code = service
            .upstream_connect(
                warm.pool_id,
                Some(warm.group.clone()),
                cold.pool_id,
                Some(cold.group.clone()),
            )
            .await;
        assert_eq!(code, ResultCode::Ok);
        for rank in 0..2 {
            let state = cold.service(rank).state();
            assert!(state.is_connected(TierRole::Warmer));
        }
        let record = service.state().get(TierRole::Warmer);
        assert_eq!(record.identity, Some(warm.identity()));
        assert_eq!(record.ranks.count(), 1);
        assert_eq!(cluster.fabric().broadcast_log(), vec![(cold.pool_id, TierRole::Warmer.tag())]);
    }

    #[tokio::test]
    async fn test_upstream_connect_rejects_second_warm_pool() {
        let cluster = cluster(&[("warm", 1), ("other", 1), ("cold", 2)]);
        let (w1, w2, cold) = (cluster.tier(0), cluster.tier(1), cluster.tier(2));
        let service = cold.service(0);

        let first = service
            .upstream_connect(w1.pool_id, Some(w1.group.clone()), cold.pool_id, Some(cold.group.clone()))
            .await;
        let second = service
            .upstream_connect(w2.pool_id, Some(w2.group.clone()), cold.pool_id, Some(cold.group.clone()))
            .await;
        assert_eq!(first, ResultCode::Ok);
        assert_eq!(second, ResultCode::IdentityMismatch);
        assert_eq!(cluster.fabric().connect_log(), vec![w1.pool_id]);

        for rank in 0..2 {
            let record = cold.service(rank).state().get(TierRole::Warmer);
            assert_eq!(record.handle.map(|h| h.pool_id()), Some(w1.pool_id));
        }
        assert_eq!(service.state().identity(TierRole::Warmer), Some(w1.identity()));
    }

    #[tokio::test]
    async fn test_upstream_connect_same_warm_pool_reconnects() {
        let cluster = cluster(&[("warm", 1), ("cold", 1)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        let service = cold.service(0);
        for _ in 0..2 {
            let code = service
                .upstream_connect(warm.pool_id, Some(warm.group.clone()), cold.pool_id, Some(cold.group.clone()))
                .await;
            assert_eq!(code, ResultCode::Ok);
        }
        assert_eq!(cluster.fabric().connect_log(), vec![warm.pool_id, warm.pool_id]);
    }

    #[tokio::test]
    async fn test_cross_connect_rejects_other_local_pool() {
        let cluster = cluster(&[("warm", 1), ("cold", 1)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        let service = warm.service(0);
        service
            .state()
            .register_identity(TierRole::This, warm.identity(), RankList::sequential(1, 8).unwrap())
            .unwrap();
        service.register_colder(cold.pool_id, Some(cold.group.clone()));

        let report = service
            .cross_connect(PoolId::generate(), Some(warm.group.clone()))
            .await;
        assert_eq!(report.code, ResultCode::IdentityMismatch);
        assert_eq!(report.linkage, Linkage::Unlinked);
        assert_eq!(cluster.fabric().connect_count(), 0);
        assert_eq!(cluster.fabric().broadcast_count(), 0);
        assert_eq!(service.state().identity(TierRole::This), Some(warm.identity()));
    }

    #[tokio::test]
    async fn test_downstream_rechecks_connected_after_claiming_slot() {
        let cluster = cluster(&[("warm", 1), ("cold", 1)]);
        let (warm, cold) = (cluster.tier(0), cluster.tier(1));
        let service = warm.service(0);
        service.register_colder(cold.pool_id, Some(cold.group.clone()));
        // Another request finished the downstream link after this one passed
        // its initial connected check.
        let first = crate::types::PoolHandle::new(
            cold.pool_id,
            Some(cold.group.clone()),
            ConnectMode::ReadWrite,
            uuid::Uuid::new_v4(),
            RankId::new(0),
        );
        service.state().set_handle(TierRole::Colder, first);
        let session = service.state().get(TierRole::Colder).handle.map(|h| h.session());

        let mut run = CrossConnectRun::new(warm.pool_id);
        let result = service.link_downstream(&mut run, &warm.identity(), &cold.identity()).await;
        let failure = result.err().unwrap();
        assert_eq!(failure.code, ResultCode::AlreadyConnected);
        assert_eq!(cluster.fabric().connect_count(), 0);
        assert_eq!(service.state().get(TierRole::Colder).handle.map(|h| h.session()), session);
    }

    #[tokio::test]
    async fn test_register_colder_rejects_oversized_group() {
        let mut cluster = SimCluster::new(TierConfig {
            rank_capacity: 2,
            ..TierConfig::default()
        });
        cluster.add_tier("warm", 1);
        cluster.add_tier("cold", 3);
        cluster.add_tier("small", 2);
        let service = cluster.tier(0).service(0);
        let cold = cluster.tier(1);

        let code = service.register_colder(cold.pool_id, Some(cold.group.clone()));
        assert_eq!(code, ResultCode::ConfigurationError);
        assert_eq!(service.state().identity(TierRole::Colder), None);

        let small = cluster.tier(2);
        assert_eq!(service.register_colder(small.pool_id, Some(small.group.clone())), ResultCode::Ok);
        assert_eq!(service.state().get(TierRole::Colder).ranks.count(), 2);
    }

    #[tokio::test]
    async fn test_handle_broadcast_rejects_bad_tag() {
        let cluster = cluster(&[("warm", 1)]);
        let service = cluster.tier(0).service(0);
        let code = service.handle_broadcast(7, MarshalledHandle::from_bytes(vec![1]));
        assert_eq!(code, ResultCode::InvalidRoleTag);
    }
}
