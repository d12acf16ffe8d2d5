//! Async adapter around the opaque pool-connect operation.
//!
//! The connector submits a pool open and reports the result through a
//! [`CompletionSignal`]. The adapter binds one signal per call and awaits it,
//! so a pending connect suspends only the calling task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{TierError, TierResult};
use crate::types::{ConnectMode, PoolHandle, PoolInfo, RankList, TierIdentity};

/// Pool open request handed to the connector.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Adapter-assigned request ID, for log correlation.
    pub request_id: u64,
    /// Pool and group to open.
    pub identity: TierIdentity,
    /// Service ranks of the pool.
    pub ranks: RankList,
    /// Requested access mode.
    pub mode: ConnectMode,
}

/// Successful connect result.
#[derive(Debug)]
pub struct PoolConnection {
    /// Handle valid on the connecting rank.
    pub handle: PoolHandle,
    /// Pool information reported by the pool service.
    pub info: PoolInfo,
}

/// One-shot completion signal for a submitted connect.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<TierResult<PoolConnection>>,
}

impl CompletionSignal {
    /// Creates a signal and the receiver that observes it.
    pub fn channel() -> (Self, oneshot::Receiver<TierResult<PoolConnection>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Fires the signal. A receiver that already gave up is ignored.
    pub fn complete(self, result: TierResult<PoolConnection>) {
        let _ = self.tx.send(result);
    }
}

/// Pool-connect collaborator.
///
/// `submit` only reports submission failures; the connect outcome arrives
/// through the signal. Dropping the signal without completing it cancels the
/// operation.
pub trait PoolConnector: Send + Sync + 'static {
    /// Submits an asynchronous pool open.
    fn submit(&self, request: ConnectRequest, completion: CompletionSignal) -> TierResult<()>;
}

/// Awaitable pool connect.
pub struct ConnectAdapter {
    connector: Arc<dyn PoolConnector>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectAdapter {
    /// Creates an adapter with the given completion timeout.
    pub fn new(connector: Arc<dyn PoolConnector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a pool and waits for the completion signal.
    pub async fn connect_pool(
        &self,
        identity: &TierIdentity,
        ranks: &RankList,
        mode: ConnectMode,
    ) -> TierResult<PoolConnection> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (signal, rx) = CompletionSignal::channel();
        let request = ConnectRequest {
            request_id,
            identity: identity.clone(),
            ranks: ranks.clone(),
            mode,
        };

        debug!(request_id, identity = %identity, ranks = ranks.count(), mode = ?mode, "submitting pool connect");
        if let Err(e) = self.connector.submit(request, signal) {
            error!(request_id, identity = %identity, error = %e, "pool connect submission failed");
            return Err(e);
        }

        let timeout_ms = self.timeout.as_millis() as u64;
        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TierError::Canceled {
                operation: "pool connect",
            }),
            Err(_) => Err(TierError::Timeout {
                operation: "pool connect",
                timeout_ms,
            }),
        };

        match &result {
            Ok(conn) => debug!(
                request_id,
                pool = %conn.info.pool_id,
                leader = %conn.info.leader,
                "pool connect complete"
            ),
            Err(e) => error!(request_id, identity = %identity, error = %e, "pool connect failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolId, RankId};
    use parking_lot::Mutex;
    use uuid::Uuid;

    enum Behavior {
        Succeed,
        Fail(i32),
        Drop,
        Hang,
        RejectSubmit,
    }

    struct ScriptedConnector {
        behavior: Behavior,
        parked: Mutex<Vec<CompletionSignal>>,
    }

    impl ScriptedConnector {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                parked: Mutex::new(Vec::new()),
            })
        }
    }

    impl PoolConnector for ScriptedConnector {
        fn submit(&self, request: ConnectRequest, completion: CompletionSignal) -> TierResult<()> {
            match self.behavior {
                Behavior::Succeed => {
                    tokio::spawn(async move {
                        let pool_id = request.identity.pool_id;
                        completion.complete(Ok(PoolConnection {
                            handle: PoolHandle::new(
                                pool_id,
                                request.identity.group.clone(),
                                request.mode,
                                Uuid::new_v4(),
                                RankId::new(0),
                            ),
                            info: PoolInfo {
                                pool_id,
                                target_count: 4,
                                leader: RankId::new(0),
                                map_version: 1,
                            },
                        }));
                    });
                }
                Behavior::Fail(code) => completion.complete(Err(TierError::Connect {
                    code,
                    reason: "refused".to_string(),
                })),
                Behavior::Drop => drop(completion),
                Behavior::Hang => self.parked.lock().push(completion),
                Behavior::RejectSubmit => {
                    return Err(TierError::Transport {
                        code: -1020,
                        reason: "no context".to_string(),
                    })
                }
            }
            Ok(())
        }
    }

    fn identity() -> TierIdentity {
        TierIdentity::new(PoolId::generate(), Some("cold".to_string()))
    }

    fn adapter(connector: Arc<ScriptedConnector>) -> ConnectAdapter {
        ConnectAdapter::new(connector, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_connect_success() {
        let id = identity();
        let conn = adapter(ScriptedConnector::new(Behavior::Succeed))
            .connect_pool(&id, &RankList::placeholder(8), ConnectMode::ReadWrite)
            .await
            .unwrap();
        assert_eq!(conn.handle.pool_id(), id.pool_id);
        assert_eq!(conn.info.pool_id, id.pool_id);
    }

    #[tokio::test]
    async fn test_connect_failure_code_passes_through() {
        let result = adapter(ScriptedConnector::new(Behavior::Fail(-1026)))
            .connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadWrite)
            .await;
        assert!(matches!(result, Err(TierError::Connect { code: -1026, .. })));
    }

    #[tokio::test]
    async fn test_dropped_signal_is_canceled() {
        let result = adapter(ScriptedConnector::new(Behavior::Drop))
            .connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadWrite)
            .await;
        assert!(matches!(result, Err(TierError::Canceled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_times_out() {
        let result = adapter(ScriptedConnector::new(Behavior::Hang))
            .connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadWrite)
            .await;
        assert!(matches!(result, Err(TierError::Timeout { timeout_ms: 200, .. })));
    }

    #[tokio::test]
    async fn test_submission_failure_is_returned() {
        let result = adapter(ScriptedConnector::new(Behavior::RejectSubmit))
            .connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadWrite)
            .await;
        assert!(matches!(result, Err(TierError::Transport { code: -1020, .. })));
    }

    #[tokio::test]
    async fn test_pending_connect_does_not_block_others() {
        let hung = Arc::new(adapter(ScriptedConnector::new(Behavior::Hang)));
        let fast = adapter(ScriptedConnector::new(Behavior::Succeed));

        let pending = {
            let hung = hung.clone();
            tokio::spawn(async move {
                hung.connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadWrite)
                    .await
            })
        };

        let conn = fast
            .connect_pool(&identity(), &RankList::placeholder(8), ConnectMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(conn.handle.mode(), ConnectMode::ReadOnly);
        assert!(!pending.is_finished());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TierError::Timeout { .. })));
    }
}
