//! Coordinator client.
//!
//! The coordinator is a dedicated KV store used only for the meta-clock
//! key and the clock-reconstitution mutex; it is not part of the data
//! plane.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::core::error::ProxyResult;
use crate::membership::client::{KvApi, LeaseApi};
use crate::proto::{
    compare, request_op, Compare, DeleteRangeRequest, LeaseGrantRequest, LeaseKeepAliveRequest,
    PutRequest, RangeRequest, RequestOp, TxnRequest,
};
use crate::scheme;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_LEASE_TTL_SECS: i64 = 10;

/// Handle to the coordinator: its KV surface plus the reconstitution lock.
#[derive(Clone)]
pub struct CoordinatorClient {
    pub kv: Arc<dyn KvApi>,
    pub clock_lock: Arc<KvMutex>,
}

impl CoordinatorClient {
    pub fn new(kv: Arc<dyn KvApi>, lease: Arc<dyn LeaseApi>) -> Self {
        let clock_lock = Arc::new(KvMutex::new(
            kv.clone(),
            lease,
            scheme::CLOCK_LOCK_KEY.to_vec(),
        ));
        Self { kv, clock_lock }
    }
}

/// Distributed mutex hosted on the coordinator.
///
/// Every acquisition grants a fresh short-TTL lease and puts a holder id
/// under it with a create-if-absent transaction; contention retries with a
/// fixed delay. While the lock is held a background task refreshes the
/// lease, so a crashed holder's lock expires while a live holder's does
/// not. Release deletes the key only while it still carries this holder's
/// id, so an expired lease cannot release a successor's lock.
pub struct KvMutex {
    kv: Arc<dyn KvApi>,
    lease: Arc<dyn LeaseApi>,
    key: Vec<u8>,
    holder: Vec<u8>,
}

impl KvMutex {
    pub fn new(kv: Arc<dyn KvApi>, lease: Arc<dyn LeaseApi>, key: Vec<u8>) -> Self {
        let holder = format!("{:016x}", rand::thread_rng().gen::<u64>()).into_bytes();
        Self {
            kv,
            lease,
            key,
            holder,
        }
    }

    /// Block until the lock is held. May wait indefinitely under
    /// contention, like the mutex it replaces.
    pub async fn lock(self: Arc<Self>) -> ProxyResult<MutexGuard> {
        let lease = self
            .lease
            .lease_grant(LeaseGrantRequest {
                ttl: LOCK_LEASE_TTL_SECS,
                id: 0,
            })
            .await?;
        loop {
            let req = TxnRequest {
                compare: vec![Compare {
                    result: compare::CompareResult::Equal as i32,
                    target: compare::CompareTarget::Create as i32,
                    key: self.key.clone(),
                    target_union: Some(compare::TargetUnion::CreateRevision(0)),
                    range_end: vec![],
                }],
                success: vec![RequestOp {
                    request: Some(request_op::Request::RequestPut(PutRequest {
                        key: self.key.clone(),
                        value: self.holder.clone(),
                        lease: lease.id,
                        ..Default::default()
                    })),
                }],
                failure: vec![RequestOp {
                    request: Some(request_op::Request::RequestRange(RangeRequest {
                        key: self.key.clone(),
                        ..Default::default()
                    })),
                }],
            };
            let resp = self.kv.txn(req).await?;
            if resp.succeeded {
                let keepalive = spawn_keepalive(self.lease.clone(), lease.id);
                return Ok(MutexGuard {
                    mutex: self,
                    keepalive,
                    released: false,
                });
            }
            sleep(LOCK_RETRY_DELAY).await;
        }
    }

    async fn release(&self) -> ProxyResult<()> {
        let req = TxnRequest {
            compare: vec![Compare {
                result: compare::CompareResult::Equal as i32,
                target: compare::CompareTarget::Value as i32,
                key: self.key.clone(),
                target_union: Some(compare::TargetUnion::Value(self.holder.clone())),
                range_end: vec![],
            }],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestDeleteRange(DeleteRangeRequest {
                    key: self.key.clone(),
                    ..Default::default()
                })),
            }],
            failure: vec![],
        };
        self.kv.txn(req).await?;
        Ok(())
    }
}

/// Refresh the session lease until aborted. A failed refresh means the
/// lease is gone and the lock key will expire with it; there is nothing
/// left to keep alive.
fn spawn_keepalive(lease: Arc<dyn LeaseApi>, lease_id: i64) -> JoinHandle<()> {
    let interval = Duration::from_secs((LOCK_LEASE_TTL_SECS as u64 / 3).max(1));
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            match lease
                .lease_keep_alive(LeaseKeepAliveRequest { id: lease_id })
                .await
            {
                Ok(reply) => debug!(lease_id, ttl = reply.ttl, "refreshed lock session lease"),
                Err(err) => {
                    warn!(lease_id, error = %err, "lock session lease refresh failed");
                    return;
                }
            }
        }
    })
}

/// Held lock. Dropping the guard spawns the release onto the runtime, so
/// cancellation of the locking task cannot leak the lock.
pub struct MutexGuard {
    mutex: Arc<KvMutex>,
    keepalive: JoinHandle<()>,
    released: bool,
}

impl MutexGuard {
    /// Release explicitly and surface the outcome.
    pub async fn unlock(mut self) -> ProxyResult<()> {
        self.released = true;
        self.keepalive.abort();
        self.mutex.release().await
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.keepalive.abort();
        if !self.released {
            let mutex = self.mutex.clone();
            tokio::spawn(async move {
                if let Err(err) = mutex.release().await {
                    warn!(error = %err, "failed to release clock reconstitution lock");
                }
            });
        }
    }
}
