//! Tier RPC protocol types and dispatch.
//!
//! Maps the four tier operations to opcodes 0x0601-0x0604. Requests and
//! replies are bincode-encoded; the transport and group layers are reached
//! through [`TierMessenger`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ResultCode, TierResult, ERR_INVAL};
use crate::handle::MarshalledHandle;
use crate::protocol::TierService;
use crate::types::{PoolId, RankId};

/// Tier RPC opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TierOpcode {
    /// Register the colder neighbor.
    RegisterColder = 0x0601,
    /// Connect downstream, locally, and trigger upstream.
    CrossConnect = 0x0602,
    /// Connect back to the warmer neighbor.
    UpstreamConnect = 0x0603,
    /// Install a broadcast pool handle.
    HandleBroadcast = 0x0604,
}

impl TierOpcode {
    /// Decodes a raw opcode.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x0601 => Some(TierOpcode::RegisterColder),
            0x0602 => Some(TierOpcode::CrossConnect),
            0x0603 => Some(TierOpcode::UpstreamConnect),
            0x0604 => Some(TierOpcode::HandleBroadcast),
            _ => None,
        }
    }
}

/// Tier operation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierRequest {
    /// Record the colder neighbor of the receiving tier.
    RegisterColder {
        /// Colder pool.
        colder_pool_id: PoolId,
        /// Colder server group.
        colder_group: Option<String>,
    },
    /// Run the cross-connection on the receiving (warm) tier.
    CrossConnect {
        /// The receiving tier's own pool.
        warm_pool_id: PoolId,
        /// The receiving tier's own group.
        warm_group: Option<String>,
    },
    /// Ask the colder tier to connect back to the warm tier.
    UpstreamConnect {
        /// Warm pool to connect to.
        warm_pool_id: PoolId,
        /// Warm server group.
        warm_group: Option<String>,
        /// The receiving (cold) tier's pool.
        cold_pool_id: PoolId,
        /// The receiving (cold) tier's group.
        cold_group: Option<String>,
    },
    /// Install a handle under the tagged role.
    HandleBroadcast {
        /// Raw role tag (`This = 0`, `Warmer = 1`, `Colder = 2`).
        role_tag: u8,
        /// Global form of the handle.
        handle: MarshalledHandle,
    },
}

impl TierRequest {
    /// Opcode for this request.
    pub fn opcode(&self) -> TierOpcode {
        match self {
            TierRequest::RegisterColder { .. } => TierOpcode::RegisterColder,
            TierRequest::CrossConnect { .. } => TierOpcode::CrossConnect,
            TierRequest::UpstreamConnect { .. } => TierOpcode::UpstreamConnect,
            TierRequest::HandleBroadcast { .. } => TierOpcode::HandleBroadcast,
        }
    }

    /// Encodes the request for the wire.
    pub fn encode(&self) -> TierResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a request from the wire.
    pub fn decode(bytes: &[u8]) -> TierResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Reply to every tier request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReply {
    /// Outcome of the request.
    pub code: ResultCode,
}

impl TierReply {
    /// Reply carrying `code`.
    pub fn new(code: ResultCode) -> Self {
        Self { code }
    }

    /// Success reply.
    pub fn ok() -> Self {
        Self::new(ResultCode::Ok)
    }

    /// Encodes the reply for the wire.
    pub fn encode(&self) -> TierResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a reply from the wire.
    pub fn decode(bytes: &[u8]) -> TierResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Address of one rank within a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Target group, `None` for the default group.
    pub group: Option<String>,
    /// Target rank.
    pub rank: RankId,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(group: Option<String>, rank: RankId) -> Self {
        Self { group, rank }
    }
}

/// One member's reply to a broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberReply {
    /// Replying rank.
    pub rank: RankId,
    /// Its outcome.
    pub code: ResultCode,
}

/// RPC transport collaborator.
#[async_trait]
pub trait TierMessenger: Send + Sync + 'static {
    /// Sends a request to one endpoint and waits for its reply.
    async fn send(&self, target: &Endpoint, request: TierRequest) -> TierResult<TierReply>;

    /// Sends a request to every member of the group serving `pool_id` and
    /// returns each member's reply. Members that could not be reached are
    /// reported with a failure code rather than omitted.
    async fn broadcast(&self, pool_id: PoolId, request: TierRequest) -> TierResult<Vec<MemberReply>>;
}

/// Dispatches tier requests to a [`TierService`].
///
/// Every request yields exactly one reply, including undecodable ones.
pub struct TierRpcDispatcher {
    service: Arc<TierService>,
}

impl TierRpcDispatcher {
    /// Creates a dispatcher backed by `service`.
    pub fn new(service: Arc<TierService>) -> Self {
        Self { service }
    }

    /// The service requests are dispatched to.
    pub fn service(&self) -> &Arc<TierService> {
        &self.service
    }

    /// Dispatches a decoded request.
    pub async fn dispatch(&self, request: TierRequest) -> TierReply {
        let opcode = request.opcode();
        debug!(opcode = ?opcode, rank = %self.service.local_rank(), "dispatching tier request");
        let code = match request {
            TierRequest::RegisterColder {
                colder_pool_id,
                colder_group,
            } => self.service.register_colder(colder_pool_id, colder_group),
            TierRequest::CrossConnect {
                warm_pool_id,
                warm_group,
            } => {
                self.service
                    .cross_connect(warm_pool_id, warm_group)
                    .await
                    .code
            }
            TierRequest::UpstreamConnect {
                warm_pool_id,
                warm_group,
                cold_pool_id,
                cold_group,
            } => {
                self.service
                    .upstream_connect(warm_pool_id, warm_group, cold_pool_id, cold_group)
                    .await
            }
            TierRequest::HandleBroadcast { role_tag, handle } => {
                self.service.handle_broadcast(role_tag, handle)
            }
        };
        TierReply::new(code)
    }

    /// Decodes, dispatches, and encodes the reply for a raw request frame.
    pub async fn handle_frame(&self, frame: &[u8]) -> TierResult<Vec<u8>> {
        let reply = match TierRequest::decode(frame) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "undecodable tier request");
                TierReply::new(ResultCode::Failed(ERR_INVAL))
            }
        };
        reply.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_mapping() {
        let req = TierRequest::RegisterColder {
            colder_pool_id: PoolId::generate(),
            colder_group: None,
        };
        assert_eq!(req.opcode() as u16, 0x0601);

        let req = TierRequest::HandleBroadcast {
            role_tag: 2,
            handle: MarshalledHandle::from_bytes(vec![1, 2, 3]),
        };
        assert_eq!(req.opcode() as u16, 0x0604);
        assert_eq!(TierOpcode::from_u16(0x0603), Some(TierOpcode::UpstreamConnect));
        assert_eq!(TierOpcode::from_u16(0x0101), None);
    }

    #[test]
    fn test_upstream_request_wire_format() {
        let req = TierRequest::UpstreamConnect {
            warm_pool_id: PoolId::generate(),
            warm_group: Some("warm".to_string()),
            cold_pool_id: PoolId::generate(),
            cold_group: None,
        };
        let decoded = TierRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_reply_carries_passthrough_code() {
        let reply = TierReply::new(ResultCode::Failed(-1026));
        let decoded = TierReply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.code, ResultCode::Failed(-1026));
    }

    #[test]
    fn test_truncated_request_fails_to_decode() {
        let req = TierRequest::CrossConnect {
            warm_pool_id: PoolId::generate(),
            warm_group: Some("warm".to_string()),
        };
        let bytes = req.encode().unwrap();
        assert!(TierRequest::decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
