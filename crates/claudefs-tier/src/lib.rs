#![warn(missing_docs)]

//! ClaudeFS subsystem: Tier cross-connection protocol, pool handle broadcast, device access policy

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod connect;
pub mod device_policy;
pub mod error;
pub mod group;
pub mod handle;
pub mod protocol;
pub mod rpc;
pub mod sim;
pub mod state;
pub mod types;

pub use broadcast::{install_broadcast_handle, BroadcastSummary, HandleBroadcaster};
pub use config::TierConfig;
pub use connect::{CompletionSignal, ConnectAdapter, ConnectRequest, PoolConnection, PoolConnector};
pub use device_policy::{DeviceAccessPolicy, PciAddr};
pub use error::{ResultCode, TierError, TierResult};
pub use group::{GroupDirectory, RankResolution};
pub use handle::MarshalledHandle;
pub use protocol::{CrossConnectPhase, CrossConnectReport, Linkage, TierCollaborators, TierService};
pub use rpc::{Endpoint, MemberReply, TierMessenger, TierOpcode, TierReply, TierRequest, TierRpcDispatcher};
pub use state::{TierConnection, TierState, TierStatus};
pub use types::{ConnectMode, PoolHandle, PoolId, RankId, RankList, TierIdentity, TierRole};
