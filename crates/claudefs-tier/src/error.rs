//! Error types and wire result codes for the tier subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{RankId, TierRole};

/// Result type alias for tier operations.
pub type TierResult<T> = Result<T, TierError>;

/// Invalid argument or undecodable payload.
pub const ERR_INVAL: i32 = -1003;
/// Entry already exists.
pub const ERR_EXIST: i32 = -1004;
/// Entry (group, pool, rank) does not exist.
pub const ERR_NONEXIST: i32 = -1005;
/// Operation timed out.
pub const ERR_TIMEDOUT: i32 = -1011;
/// Operation was canceled before completing.
pub const ERR_CANCELED: i32 = -1012;
/// Local I/O failure.
pub const ERR_IO: i32 = -1013;
/// Unclassified failure; stands in for collaborator codes that collide with
/// tier codes.
pub const ERR_MISC: i32 = -1025;

/// Codes in this range are symbolic tier codes and never carried by `Failed`.
pub const TIER_CODE_RANGE: std::ops::RangeInclusive<i32> = -3099..=-3000;

/// Error variants for tier cross-connection operations.
#[derive(Debug, Error)]
pub enum TierError {
    /// No colder tier has been registered beneath this one.
    #[error("no colder tier registered beneath this tier")]
    NoColderTier,

    /// The connection for this role already exists.
    #[error("{role:?} tier connection already established")]
    AlreadyConnected {
        /// The role that is already connected.
        role: TierRole,
    },

    /// An identity for this role is already registered.
    #[error("{role:?} identity already registered as pool {pool}")]
    AlreadyRegistered {
        /// The role that already has an identity.
        role: TierRole,
        /// Pool of the existing identity.
        pool: String,
    },

    /// A request named a different pool or group than the identity already
    /// registered for the role.
    #[error("{role:?} identity is {registered}, request names {requested}")]
    IdentityMismatch {
        /// The role whose identity is fixed.
        role: TierRole,
        /// Identity already registered.
        registered: String,
        /// Identity named by the request.
        requested: String,
    },

    /// Another connect for this role is still in flight.
    #[error("{role:?} tier connect already in progress")]
    ConnectInProgress {
        /// The role with an in-flight connect.
        role: TierRole,
    },

    /// One or more group members failed to install a broadcast handle.
    #[error("handle broadcast failed on {} of {} members", .failed_ranks.len(), .total_members)]
    HandleBroadcast {
        /// Ranks that rejected or never acknowledged the handle.
        failed_ranks: Vec<RankId>,
        /// Number of members the broadcast was addressed to.
        total_members: usize,
    },

    /// A broadcast carried a role tag outside {This, Warmer, Colder}.
    #[error("invalid role tag: {0}")]
    InvalidRoleTag(u8),

    /// Downstream and local linkage exist but the upstream trigger failed.
    #[error("tier partially linked: upstream trigger failed with code {upstream_code}")]
    PartiallyLinked {
        /// Code returned (or produced) by the failed upstream step.
        upstream_code: i32,
    },

    /// Invalid tier configuration (rank capacity, timeouts, group sizes).
    #[error("configuration error: {reason}")]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// The device configuration document could not be turned into a policy.
    #[error("device config error: {reason}")]
    DeviceConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Marshalling or frame encoding failed.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the problem.
        reason: String,
    },

    /// The underlying pool-connect operation failed.
    #[error("pool connect failed ({code}): {reason}")]
    Connect {
        /// Collaborator result code, passed through unmodified.
        code: i32,
        /// Description of the failure.
        reason: String,
    },

    /// The RPC transport failed to deliver a request or reply.
    #[error("transport error ({code}): {reason}")]
    Transport {
        /// Collaborator result code, passed through unmodified.
        code: i32,
        /// Description of the failure.
        reason: String,
    },

    /// Group lookup failed.
    #[error("group not found: {group}")]
    GroupNotFound {
        /// The group name that was looked up.
        group: String,
    },

    /// An awaited operation did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The completion signal for an operation was dropped without a result.
    #[error("{operation} canceled before completion")]
    Canceled {
        /// Operation that was canceled.
        operation: &'static str,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for TierError {
    fn from(e: bincode::Error) -> Self {
        TierError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Symbolic result code carried in every tier RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Success.
    Ok,
    /// This tier is the coldest; nothing to connect to.
    NoColderTier,
    /// The colder connection already exists.
    AlreadyConnected,
    /// A colder tier was already registered.
    ColdAlreadySet,
    /// A handle broadcast did not reach every member.
    HandleBroadcastError,
    /// Broadcast carried an unknown role tag.
    InvalidRoleTag,
    /// Downstream and local linkage succeeded, upstream trigger failed.
    PartiallyLinked,
    /// Rejected configuration (e.g. group larger than rank capacity).
    ConfigurationError,
    /// A connect for the same role is already running.
    ConnectInProgress,
    /// Request names a tier other than the one registered for the role.
    IdentityMismatch,
    /// Collaborator or resource failure. Build it with [`ResultCode::failed`]
    /// so the code stays outside `0` and [`TIER_CODE_RANGE`].
    Failed(i32),
}

impl ResultCode {
    /// Carries a collaborator code. Codes that would read back as success or
    /// as a tier code become `Failed(ERR_MISC)`.
    pub fn failed(code: i32) -> Self {
        if code == 0 || TIER_CODE_RANGE.contains(&code) {
            ResultCode::Failed(ERR_MISC)
        } else {
            ResultCode::Failed(code)
        }
    }

    /// Returns the stable integer form of this code.
    pub fn as_i32(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::NoColderTier => -3001,
            ResultCode::AlreadyConnected => -3002,
            ResultCode::ColdAlreadySet => -3003,
            ResultCode::HandleBroadcastError => -3004,
            ResultCode::InvalidRoleTag => -3005,
            ResultCode::PartiallyLinked => -3006,
            ResultCode::ConfigurationError => -3007,
            ResultCode::ConnectInProgress => -3008,
            ResultCode::IdentityMismatch => -3009,
            ResultCode::Failed(code) => match ResultCode::failed(code) {
                ResultCode::Failed(code) => code,
                _ => ERR_MISC,
            },
        }
    }

    /// Decodes an integer code.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ResultCode::Ok,
            -3001 => ResultCode::NoColderTier,
            -3002 => ResultCode::AlreadyConnected,
            -3003 => ResultCode::ColdAlreadySet,
            -3004 => ResultCode::HandleBroadcastError,
            -3005 => ResultCode::InvalidRoleTag,
            -3006 => ResultCode::PartiallyLinked,
            -3007 => ResultCode::ConfigurationError,
            -3008 => ResultCode::ConnectInProgress,
            -3009 => ResultCode::IdentityMismatch,
            other => ResultCode::failed(other),
        }
    }

    /// Returns true for success.
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// Expected terminal outcomes that are reported but never treated as faults.
    pub fn is_protocol_state(self) -> bool {
        matches!(
            self,
            ResultCode::NoColderTier
                | ResultCode::AlreadyConnected
                | ResultCode::ColdAlreadySet
                | ResultCode::IdentityMismatch
        )
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Failed(code) => write!(f, "Failed({})", code),
            other => write!(f, "{:?}({})", other, other.as_i32()),
        }
    }
}

impl From<&TierError> for ResultCode {
    fn from(e: &TierError) -> Self {
        match e {
            TierError::NoColderTier => ResultCode::NoColderTier,
            TierError::AlreadyConnected { .. } => ResultCode::AlreadyConnected,
            TierError::AlreadyRegistered {
                role: TierRole::Colder,
                ..
            } => ResultCode::ColdAlreadySet,
            TierError::AlreadyRegistered { .. } => ResultCode::Failed(ERR_EXIST),
            TierError::ConnectInProgress { .. } => ResultCode::ConnectInProgress,
            TierError::IdentityMismatch { .. } => ResultCode::IdentityMismatch,
            TierError::HandleBroadcast { .. } => ResultCode::HandleBroadcastError,
            TierError::InvalidRoleTag(_) => ResultCode::InvalidRoleTag,
            TierError::PartiallyLinked { .. } => ResultCode::PartiallyLinked,
            TierError::Configuration { .. } | TierError::DeviceConfig { .. } => {
                ResultCode::ConfigurationError
            }
            TierError::Serialization { .. } => ResultCode::Failed(ERR_INVAL),
            TierError::Connect { code, .. } | TierError::Transport { code, .. } => {
                ResultCode::failed(*code)
            }
            TierError::GroupNotFound { .. } => ResultCode::Failed(ERR_NONEXIST),
            TierError::Timeout { .. } => ResultCode::Failed(ERR_TIMEDOUT),
            TierError::Canceled { .. } => ResultCode::Failed(ERR_CANCELED),
            TierError::Io(_) => ResultCode::Failed(ERR_IO),
        }
    }
}

impl From<TierError> for ResultCode {
    fn from(e: TierError) -> Self {
        ResultCode::from(&e)
    }
}
