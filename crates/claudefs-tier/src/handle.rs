//! Pool handle marshalling.
//!
//! A [`PoolHandle`] is only meaningful on the rank that opened it. To hand it
//! to other ranks it is converted to a location-independent
//! [`MarshalledHandle`] and reconstituted on the receiving rank.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{TierError, TierResult};
use crate::types::{ConnectMode, PoolHandle, PoolId, RankId};

/// Version of the global handle encoding.
pub const HANDLE_FORMAT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct GlobalHandle {
    version: u8,
    pool_id: PoolId,
    group: Option<String>,
    mode: ConnectMode,
    session: Uuid,
    origin: RankId,
}

/// Location-independent form of a pool handle.
///
/// Each copy is consumed by exactly one [`unmarshal`]; copies exist only
/// because a broadcast puts one on the wire per group member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalledHandle {
    bytes: Vec<u8>,
}

impl MarshalledHandle {
    /// Wraps raw bytes received from the wire.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if no bytes are present.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Converts a local handle into its global form, consuming it.
pub fn marshal(handle: PoolHandle) -> TierResult<MarshalledHandle> {
    let global = GlobalHandle {
        version: HANDLE_FORMAT_VERSION,
        pool_id: handle.pool_id(),
        group: handle.group().map(str::to_string),
        mode: handle.mode(),
        session: handle.session(),
        origin: handle.owner(),
    };

    let size = bincode::serialized_size(&global)? as usize;
    let mut bytes = Vec::with_capacity(size);
    bincode::serialize_into(&mut bytes, &global)?;
    if bytes.len() != size {
        return Err(TierError::Serialization {
            reason: format!("handle encoded to {} bytes, expected {}", bytes.len(), size),
        });
    }

    debug!(pool = %global.pool_id, origin = %global.origin, len = size, "marshalled pool handle");
    Ok(MarshalledHandle { bytes })
}

/// Reconstructs a handle owned by `local_rank` from its global form.
pub fn unmarshal(marshalled: MarshalledHandle, local_rank: RankId) -> TierResult<PoolHandle> {
    let global: GlobalHandle = bincode::deserialize(&marshalled.bytes)?;
    if global.version != HANDLE_FORMAT_VERSION {
        return Err(TierError::Serialization {
            reason: format!(
                "unsupported handle format version {} (expected {})",
                global.version, HANDLE_FORMAT_VERSION
            ),
        });
    }

    debug!(pool = %global.pool_id, origin = %global.origin, rank = %local_rank, "unmarshalled pool handle");
    Ok(PoolHandle::new(
        global.pool_id,
        global.group,
        global.mode,
        global.session,
        local_rank,
    ))
}
