//! Meta-clock service.
//!
//! The global meta-revision lives on the coordinator's clock key. `tick`
//! advances it by exactly one through a two-step transaction: an
//! ignore-value put (which bumps the key's version under linearizable
//! semantics) followed by a read of the resulting kv. `now` reads without
//! advancing. A missing clock key means the clock was lost and is
//! reconstituted from the member clusters under the coordinator's lock.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::core::error::{ProxyError, ProxyResult};
use crate::membership::coordinator::CoordinatorClient;
use crate::membership::pool::Pool;
use crate::proto::{self, PutRequest, RangeRequest, TxnRequest, response_op};
use crate::scheme;

/// The meta-clock: `now`, `tick`, and loss recovery.
pub struct MetaClock {
    coordinator: CoordinatorClient,
    pool: Arc<Pool>,
}

impl MetaClock {
    pub fn new(coordinator: CoordinatorClient, pool: Arc<Pool>) -> Self {
        Self { coordinator, pool }
    }

    /// The coordinator's KV surface, for callers that must touch the
    /// coordinator directly (compaction of the clock key's history).
    pub fn coordinator_kv(&self) -> Arc<dyn crate::membership::client::KvApi> {
        self.coordinator.kv.clone()
    }

    /// Current meta-revision, without advancing the clock.
    pub async fn now(&self) -> ProxyResult<i64> {
        let resp = self
            .coordinator
            .kv
            .range(RangeRequest {
                key: scheme::CLOCK_KEY.to_vec(),
                ..Default::default()
            })
            .await?;
        match resp.kvs.first() {
            None => self.reconstitute(0).await,
            Some(kv) => scheme::clock_meta_rev(kv),
        }
    }

    /// Advance the meta-revision by one and return the new value.
    pub async fn tick(&self) -> ProxyResult<i64> {
        let req = TxnRequest {
            compare: vec![],
            success: vec![
                proto::put_op(PutRequest {
                    key: scheme::CLOCK_KEY.to_vec(),
                    ignore_value: true,
                    ..Default::default()
                }),
                proto::range_op(RangeRequest {
                    key: scheme::CLOCK_KEY.to_vec(),
                    ..Default::default()
                }),
            ],
            failure: vec![],
        };
        let resp = match self.coordinator.kv.txn(req).await {
            Err(ProxyError::KeyNotFound) => return self.reconstitute(1).await,
            Err(err) => return Err(err),
            Ok(resp) => resp,
        };

        let kv = resp
            .responses
            .get(1)
            .and_then(|op| match &op.response {
                Some(response_op::Response::ResponseRange(r)) => r.kvs.first(),
                _ => None,
            })
            .ok_or_else(|| ProxyError::internal("clock tick returned no kv"))?;
        scheme::clock_meta_rev(kv)
    }

    /// Rebuild the lost clock from the member clusters.
    ///
    /// `delta` is 1 when a tick triggered recovery and 0 for reads. The key
    /// is written as `t - 1` so the next tick produces exactly `t` without
    /// duplicating a revision.
    async fn reconstitute(&self, delta: i64) -> ProxyResult<i64> {
        let guard = self.coordinator.clock_lock.clone().lock().await?;

        // Double-check: a concurrent recovery may have restored the key
        // while we waited for the lock.
        let resp = self
            .coordinator
            .kv
            .range(RangeRequest {
                key: scheme::CLOCK_KEY.to_vec(),
                ..Default::default()
            })
            .await?;
        if let Some(kv) = resp.kvs.first() {
            let rev = scheme::clock_meta_rev(kv)?;
            guard.unlock().await?;
            return Ok(rev);
        }

        error!("clock was lost - reconstituting from member clusters");

        let latest = Mutex::new(0i64);
        self.pool
            .for_each_member(|member| {
                let latest = &latest;
                async move {
                    let r = member.client.kv
                        .range(RangeRequest {
                            key: scheme::CLOCK_KEY.to_vec(),
                            ..Default::default()
                        })
                        .await?;
                    let Some(kv) = r.kvs.first() else {
                        return Ok(());
                    };
                    let Some(rev) = scheme::decode_meta_rev(&kv.value) else {
                        return Ok(());
                    };
                    let mut latest = latest.lock();
                    if rev > *latest {
                        *latest = rev;
                    }
                    Ok(())
                }
            })
            .await?;
        let latest_meta_rev = *latest.lock() + delta;

        let buf = scheme::encode_meta_rev(latest_meta_rev - 1);
        self.coordinator
            .kv
            .put(PutRequest {
                key: scheme::CLOCK_KEY.to_vec(),
                value: buf.to_vec(),
                ..Default::default()
            })
            .await?;

        guard.unlock().await?;
        info!(meta_rev = latest_meta_rev, "reconstituted meta cluster logic clock");
        Ok(latest_meta_rev)
    }
}
