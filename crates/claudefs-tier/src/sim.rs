//! In-process cluster simulation.
//!
//! [`SimFabric`] plays the RPC transport, group directory, and pool registry
//! for any number of tier services in one process. It records every connect
//! and broadcast and can inject connect failures, connect latency, and
//! failing broadcast members.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::TierConfig;
use crate::connect::{CompletionSignal, ConnectRequest, PoolConnection, PoolConnector};
use crate::error::{ResultCode, TierError, TierResult, ERR_NONEXIST};
use crate::group::GroupDirectory;
use crate::protocol::{TierCollaborators, TierService};
use crate::rpc::{Endpoint, MemberReply, TierMessenger, TierReply, TierRequest, TierRpcDispatcher};
use crate::state::TierStatus;
use crate::types::{group_label, GroupHandle, PoolHandle, PoolId, PoolInfo, RankId, TierIdentity};

#[derive(Clone)]
struct SimMember {
    rank: RankId,
    dispatcher: Weak<TierRpcDispatcher>,
}

/// In-process transport, group directory, and pool registry.
#[derive(Default)]
pub struct SimFabric {
    groups: DashMap<String, Vec<SimMember>>,
    pools: DashMap<PoolId, String>,
    connect_failures: DashMap<PoolId, i32>,
    member_failures: DashMap<(String, RankId), i32>,
    connect_latency_ms: AtomicU64,
    connect_log: Mutex<Vec<PoolId>>,
    broadcast_log: Mutex<Vec<(PoolId, u8)>>,
    send_calls: AtomicUsize,
}

impl SimFabric {
    /// Creates an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member to a group, creating the group if needed.
    pub fn join(&self, group: Option<&str>, rank: RankId, dispatcher: &Arc<TierRpcDispatcher>) {
        self.groups
            .entry(group_label(group).to_string())
            .or_default()
            .push(SimMember {
                rank,
                dispatcher: Arc::downgrade(dispatcher),
            });
    }

    /// Registers a pool as served by `group`.
    pub fn add_pool(&self, pool_id: PoolId, group: Option<&str>) {
        self.pools.insert(pool_id, group_label(group).to_string());
    }

    /// Fails every connect to `pool_id` with `code`.
    pub fn fail_connect(&self, pool_id: PoolId, code: i32) {
        self.connect_failures.insert(pool_id, code);
    }

    /// Makes one member answer every broadcast with `code`.
    pub fn fail_member(&self, group: Option<&str>, rank: RankId, code: i32) {
        self.member_failures
            .insert((group_label(group).to_string(), rank), code);
    }

    /// Delays every connect completion.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Pools connected so far, in submission order.
    pub fn connect_log(&self) -> Vec<PoolId> {
        self.connect_log.lock().clone()
    }

    /// `(target pool, role tag)` of every handle broadcast, in order.
    pub fn broadcast_log(&self) -> Vec<(PoolId, u8)> {
        self.broadcast_log.lock().clone()
    }

    /// Number of connects submitted.
    pub fn connect_count(&self) -> usize {
        self.connect_log.lock().len()
    }

    /// Number of handle broadcasts sent.
    pub fn broadcast_count(&self) -> usize {
        self.broadcast_log.lock().len()
    }

    /// Number of point-to-point sends.
    pub fn send_count(&self) -> usize {
        self.send_calls.load(Ordering::Relaxed)
    }

    fn members(&self, label: &str) -> Option<Vec<SimMember>> {
        self.groups.get(label).map(|m| m.value().clone())
    }

    async fn deliver(member: &SimMember, request: &TierRequest) -> TierResult<TierReply> {
        let dispatcher = member.dispatcher.upgrade().ok_or_else(|| TierError::Transport {
            code: ERR_NONEXIST,
            reason: format!("rank {} is gone", member.rank),
        })?;
        let frame = request.encode()?;
        let reply = dispatcher.handle_frame(&frame).await?;
        TierReply::decode(&reply)
    }
}

#[async_trait]
impl TierMessenger for SimFabric {
    async fn send(&self, target: &Endpoint, request: TierRequest) -> TierResult<TierReply> {
        self.send_calls.fetch_add(1, Ordering::Relaxed);
        let label = group_label(target.group.as_deref());
        let members = self.members(label).ok_or_else(|| TierError::GroupNotFound {
            group: label.to_string(),
        })?;
        let member = members
            .iter()
            .find(|m| m.rank == target.rank)
            .ok_or_else(|| TierError::Transport {
                code: ERR_NONEXIST,
                reason: format!("no rank {} in group {}", target.rank, label),
            })?;
        debug!(group = label, rank = %target.rank, opcode = ?request.opcode(), "sim send");
        Self::deliver(member, &request).await
    }

    async fn broadcast(&self, pool_id: PoolId, request: TierRequest) -> TierResult<Vec<MemberReply>> {
        let label = self
            .pools
            .get(&pool_id)
            .map(|g| g.value().clone())
            .ok_or_else(|| TierError::GroupNotFound {
                group: pool_id.to_string(),
            })?;
        if let TierRequest::HandleBroadcast { role_tag, .. } = &request {
            self.broadcast_log.lock().push((pool_id, *role_tag));
        }
        let members = self.members(&label).unwrap_or_default();

        let mut replies = Vec::with_capacity(members.len());
        for member in &members {
            let injected = self
                .member_failures
                .get(&(label.clone(), member.rank))
                .map(|c| *c.value());
            let code = match injected {
                Some(code) => ResultCode::failed(code),
                None => match Self::deliver(member, &request).await {
                    Ok(reply) => reply.code,
                    Err(e) => ResultCode::from(e),
                },
            };
            replies.push(MemberReply {
                rank: member.rank,
                code,
            });
        }
        Ok(replies)
    }
}

#[async_trait]
impl GroupDirectory for SimFabric {
    fn lookup(&self, name: Option<&str>) -> Option<GroupHandle> {
        self.groups
            .contains_key(group_label(name))
            .then(|| GroupHandle::new(name.map(str::to_string)))
    }

    fn group_size(&self, group: &GroupHandle) -> TierResult<u32> {
        self.groups
            .get(group_label(group.name()))
            .map(|m| m.len() as u32)
            .ok_or_else(|| TierError::GroupNotFound {
                group: group_label(group.name()).to_string(),
            })
    }

    async fn attach(&self, name: Option<&str>) -> TierResult<GroupHandle> {
        self.lookup(name).ok_or_else(|| TierError::GroupNotFound {
            group: group_label(name).to_string(),
        })
    }
}

/// Pool connector backed by the fabric's pool registry.
pub struct SimPoolConnector {
    fabric: Arc<SimFabric>,
    local_rank: RankId,
}

impl SimPoolConnector {
    /// Connector for a service running on `local_rank`.
    pub fn new(fabric: Arc<SimFabric>, local_rank: RankId) -> Self {
        Self { fabric, local_rank }
    }
}

impl PoolConnector for SimPoolConnector {
    fn submit(&self, request: ConnectRequest, completion: CompletionSignal) -> TierResult<()> {
        let pool_id = request.identity.pool_id;
        self.fabric.connect_log.lock().push(pool_id);

        let outcome = if let Some(code) = self.fabric.connect_failures.get(&pool_id) {
            Err(TierError::Connect {
                code: *code.value(),
                reason: "injected connect failure".to_string(),
            })
        } else if !self.fabric.pools.contains_key(&pool_id) {
            Err(TierError::Connect {
                code: ERR_NONEXIST,
                reason: format!("pool {} does not exist", pool_id),
            })
        } else {
            Ok(PoolConnection {
                handle: PoolHandle::new(
                    pool_id,
                    request.identity.group.clone(),
                    request.mode,
                    Uuid::new_v4(),
                    self.local_rank,
                ),
                info: PoolInfo {
                    pool_id,
                    target_count: request.ranks.count() as u32,
                    leader: RankId::new(0),
                    map_version: 1,
                },
            })
        };

        let latency = Duration::from_millis(self.fabric.connect_latency_ms.load(Ordering::Relaxed));
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            completion.complete(outcome);
        });
        Ok(())
    }
}

/// One simulated tier: a pool and the group serving it.
pub struct SimTier {
    /// Pool of the tier.
    pub pool_id: PoolId,
    /// Group serving the pool.
    pub group: String,
    /// One dispatcher per member rank; index equals rank.
    pub nodes: Vec<Arc<TierRpcDispatcher>>,
}

impl SimTier {
    /// Identity of the tier.
    pub fn identity(&self) -> TierIdentity {
        TierIdentity::new(self.pool_id, Some(self.group.clone()))
    }

    /// Service on `rank`.
    pub fn service(&self, rank: usize) -> &Arc<TierService> {
        self.nodes[rank].service()
    }

    fn leader(&self) -> Endpoint {
        Endpoint::new(Some(self.group.clone()), RankId::new(0))
    }
}

/// Builder and driver for a simulated tier hierarchy.
pub struct SimCluster {
    fabric: Arc<SimFabric>,
    config: TierConfig,
    tiers: Vec<SimTier>,
}

impl SimCluster {
    /// Creates an empty cluster whose services share `config`.
    pub fn new(config: TierConfig) -> Self {
        Self {
            fabric: SimFabric::new(),
            config,
            tiers: Vec::new(),
        }
    }

    /// Shared fabric.
    pub fn fabric(&self) -> &Arc<SimFabric> {
        &self.fabric
    }

    /// Adds a tier of `members` ranks and returns its index.
    pub fn add_tier(&mut self, group: &str, members: u32) -> usize {
        let pool_id = PoolId::generate();
        self.fabric.add_pool(pool_id, Some(group));

        let nodes = (0..members)
            .map(|rank| {
                let rank = RankId::new(rank);
                let config = TierConfig {
                    local_rank: rank.as_u32(),
                    ..self.config.clone()
                };
                let service = TierService::new(
                    &config,
                    TierCollaborators {
                        connector: Arc::new(SimPoolConnector::new(self.fabric.clone(), rank)),
                        messenger: self.fabric.clone(),
                        directory: self.fabric.clone(),
                    },
                );
                let dispatcher = Arc::new(TierRpcDispatcher::new(Arc::new(service)));
                self.fabric.join(Some(group), rank, &dispatcher);
                dispatcher
            })
            .collect();

        self.tiers.push(SimTier {
            pool_id,
            group: group.to_string(),
            nodes,
        });
        self.tiers.len() - 1
    }

    /// Tier at `index`.
    pub fn tier(&self, index: usize) -> &SimTier {
        &self.tiers[index]
    }

    /// All tiers, warmest first.
    pub fn tiers(&self) -> &[SimTier] {
        &self.tiers
    }

    async fn send(&self, target: Endpoint, request: TierRequest) -> ResultCode {
        match self.fabric.send(&target, request).await {
            Ok(reply) => reply.code,
            Err(e) => ResultCode::from(e),
        }
    }

    /// Sends RegisterColder for `cold` to the leader of `warm`.
    pub async fn register_colder(&self, warm: usize, cold: usize) -> ResultCode {
        let cold = &self.tiers[cold];
        let request = TierRequest::RegisterColder {
            colder_pool_id: cold.pool_id,
            colder_group: Some(cold.group.clone()),
        };
        self.send(self.tiers[warm].leader(), request).await
    }

    /// Sends CrossConnect to the leader of `index`.
    pub async fn cross_connect(&self, index: usize) -> ResultCode {
        let tier = &self.tiers[index];
        let request = TierRequest::CrossConnect {
            warm_pool_id: tier.pool_id,
            warm_group: Some(tier.group.clone()),
        };
        self.send(tier.leader(), request).await
    }

    /// Registers each tier as the colder neighbor of the previous one, then
    /// cross-connects every tier from warmest to coldest.
    pub async fn link_chain(&self) -> Vec<ResultCode> {
        for warm in 1..self.tiers.len() {
            let code = self.register_colder(warm - 1, warm).await;
            debug!(warm = warm - 1, cold = warm, code = %code, "chain registration");
        }
        let mut codes = Vec::with_capacity(self.tiers.len());
        for index in 0..self.tiers.len() {
            codes.push(self.cross_connect(index).await);
        }
        codes
    }

    /// Leader status of every tier.
    pub fn status(&self) -> Vec<(String, TierStatus)> {
        self.tiers
            .iter()
            .map(|t| (t.group.clone(), t.service(0).state().status()))
            .collect()
    }
}
