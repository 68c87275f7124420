//! Meta-revision to member-revision resolution.
//!
//! Every write transaction mirrors its meta-rev onto the member's clock
//! key, so the clock key's history is a ladder from member-local revisions
//! to meta-revisions. Resolving walks that ladder backwards until it finds
//! the newest clock write at or below the target meta-rev.

use std::sync::Arc;

use tracing::debug;

use crate::core::error::ProxyResult;
use crate::membership::client::KvApi;
use crate::ops::observability::Metrics;
use crate::proto::RangeRequest;
use crate::scheme;

/// Translates meta-revisions into member-local revisions.
pub struct RevisionResolver {
    metrics: Arc<Metrics>,
}

impl RevisionResolver {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// The member-local revision at which `kv`'s store first reached
    /// `meta_rev`.
    ///
    /// A member that has never seen a write through the proxy has no clock
    /// key; its current header revision is returned so reads observe an
    /// empty snapshot. The walk terminates because the probed revision
    /// strictly decreases each iteration.
    pub async fn member_rev(&self, kv: &dyn KvApi, meta_rev: i64) -> ProxyResult<i64> {
        let mut probe = 0i64;
        let mut depth = 0u64;
        loop {
            depth += 1;
            let resp = kv
                .range(RangeRequest {
                    key: scheme::CLOCK_KEY.to_vec(),
                    revision: probe,
                    ..Default::default()
                })
                .await?;

            let Some(clock_kv) = resp.kvs.first() else {
                self.metrics.observe_member_rev_depth(depth);
                return Ok(resp.header.map(|h| h.revision).unwrap_or_default());
            };

            let last_meta_rev = scheme::decode_meta_rev(&clock_kv.value).unwrap_or(0);
            if last_meta_rev > meta_rev {
                probe = clock_kv.mod_revision - 1;
                continue;
            }

            debug!(attempts = depth, "resolved member rev");
            self.metrics.observe_member_rev_depth(depth);
            return Ok(clock_kv.mod_revision);
        }
    }
}
