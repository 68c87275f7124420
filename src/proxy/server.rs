//! Request translation layer.
//!
//! Every handler follows the same shape: obtain a meta-revision (from the
//! clock for reads at "now", from the request for explicit revisions, from
//! a tick for writes), pick one member (single key) or all members
//! (ranges), translate the meta-rev into each member's local revision, run
//! the underlying request, and rewrite the responses so modification
//! revisions carry the global meta-revs recorded in each value's suffix.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::MetaClock;
use crate::core::error::{ProxyError, ProxyResult};
use crate::membership::pool::{require_member, Member, Pool};
use crate::ops::observability::{Method, Metrics};
use crate::proto::{
    compare, response_op, watch_request, CompactionRequest, CompactionResponse, KeyValue,
    LeaseGrantRequest, LeaseGrantResponse, RangeRequest, RangeResponse, ResponseHeader,
    TxnRequest, TxnResponse, WatchRequest, WatchResponse,
};
use crate::resolver::RevisionResolver;
use crate::scheme;

/// The federation proxy.
pub struct ProxyServer {
    clock: MetaClock,
    pool: Arc<Pool>,
    resolver: RevisionResolver,
    metrics: Arc<Metrics>,
}

/// Accumulator for cross-member range fan-out. The single-key fast path
/// bypasses it entirely, so no lock is taken there.
#[derive(Default)]
struct RangeAccumulator {
    kvs: Vec<KeyValue>,
    count: i64,
}

impl ProxyServer {
    pub fn new(clock: MetaClock, pool: Arc<Pool>, metrics: Arc<Metrics>) -> Self {
        let resolver = RevisionResolver::new(metrics.clone());
        Self {
            clock,
            pool,
            resolver,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn range(&self, req: RangeRequest) -> ProxyResult<RangeResponse> {
        let start = Instant::now();
        if req.range_end.is_empty() {
            self.metrics.inc_request(Method::Get);
        } else {
            self.metrics.inc_request(Method::Range);
        }

        let meta_rev = if req.revision != 0 {
            req.revision
        } else {
            self.clock.now().await?
        };

        let mut resp = RangeResponse {
            header: Some(ResponseHeader {
                revision: meta_rev,
                ..Default::default()
            }),
            ..Default::default()
        };

        if req.range_end.is_empty() {
            let member = require_member(self.pool.member_for_key(&req.key), &req.key)?;
            let part = match self.range_on_member(&req, meta_rev, &member).await {
                Ok(part) => part,
                Err(err) => {
                    warn!(
                        key = %String::from_utf8_lossy(&req.key),
                        meta_rev,
                        latency = ?start.elapsed(),
                        error = %err,
                        "completed single-key range with error"
                    );
                    return Err(err);
                }
            };
            resp.count = part.count;
            resp.kvs = part.kvs;
            info!(
                key = %String::from_utf8_lossy(&req.key),
                meta_rev,
                latency = ?start.elapsed(),
                "completed single-key range successfully"
            );
            return Ok(resp);
        }

        let acc = Mutex::new(RangeAccumulator::default());
        let result = self
            .pool
            .for_each_member(|member| {
                let req = req.clone();
                let acc = &acc;
                async move {
                    let part = self.range_on_member(&req, meta_rev, &member).await?;
                    let mut acc = acc.lock();
                    acc.count += part.count;
                    acc.kvs.extend(part.kvs);
                    Ok(())
                }
            })
            .await;

        let merged = acc.into_inner();
        resp.count = merged.count;
        resp.kvs = merged.kvs;
        if req.limit != 0 && resp.kvs.len() as i64 > req.limit {
            resp.kvs.sort_by(|a, b| a.key.cmp(&b.key));
            resp.kvs.truncate(req.limit as usize);
            resp.more = true;
        }
        if let Err(err) = result {
            info!(
                start_key = %String::from_utf8_lossy(&req.key),
                end_key = %String::from_utf8_lossy(&req.range_end),
                meta_rev,
                count = resp.count,
                latency = ?start.elapsed(),
                error = %err,
                "completed range with error"
            );
            return Err(err);
        }
        info!(
            start_key = %String::from_utf8_lossy(&req.key),
            end_key = %String::from_utf8_lossy(&req.range_end),
            meta_rev,
            count = resp.count,
            limit = req.limit,
            latency = ?start.elapsed(),
            "completed range successfully"
        );

        Ok(resp)
    }

    async fn range_on_member(
        &self,
        req: &RangeRequest,
        meta_rev: i64,
        member: &Member,
    ) -> ProxyResult<RangeAccumulator> {
        let member_rev = self
            .resolver
            .member_rev(member.client.kv.as_ref(), meta_rev)
            .await?;

        let mut member_req = req.clone();
        member_req.revision = member_rev;
        let r = member
            .client
            .kv
            .range(member_req)
            .await
            .map_err(|err| ProxyError::Internal {
                message: format!("ranging at member rev {member_rev}: {err}"),
            })?;

        let mut part = RangeAccumulator {
            count: r.count,
            kvs: Vec::new(),
        };
        if !req.count_only {
            part.kvs = r.kvs;
            for kv in &mut part.kvs {
                scheme::resolve_mod_rev(kv);
            }
        }
        Ok(part)
    }

    pub async fn txn(&self, mut req: TxnRequest) -> ProxyResult<TxnResponse> {
        self.metrics.inc_request(Method::Txn);

        let key = scheme::txn_anchor(&req)?;
        let member = require_member(self.pool.member_for_key(&key), &key)?;

        // Rewrite meta-rev comparisons into member-local revisions, bailing
        // out early when one is provably false. One read of the anchor key
        // backs both the preflight and the rewrite.
        if req.compare.iter().any(scheme::is_mod_rev_comparison) {
            let current = member.client.get(&key).await?;
            match current.kvs.first() {
                None => {
                    // Key is gone; the member evaluates against the zero kv.
                    for cmp in &mut req.compare {
                        if scheme::is_mod_rev_comparison(cmp) {
                            cmp.target_union = Some(compare::TargetUnion::ModRevision(0));
                        }
                    }
                }
                Some(kv) => {
                    let target = req
                        .compare
                        .iter()
                        .find_map(|cmp| match cmp.target_union {
                            Some(compare::TargetUnion::ModRevision(rev)) if rev != 0 => Some(rev),
                            _ => None,
                        })
                        .unwrap_or_default();
                    let (actual_meta_rev, failure) = scheme::preflight_txn(target, &req, kv);
                    if let Some(resp) = failure {
                        warn!(
                            key = %String::from_utf8_lossy(&key),
                            meta_rev = target,
                            actual_meta_rev,
                            "txn failed pre-check"
                        );
                        return Ok(resp);
                    }
                    let member_rev = kv.mod_revision;
                    for cmp in &mut req.compare {
                        if scheme::is_mod_rev_comparison(cmp) {
                            cmp.target_union =
                                Some(compare::TargetUnion::ModRevision(member_rev));
                        }
                    }
                }
            }
        }

        let meta_rev = self.clock.tick().await?;
        let buf = scheme::encode_meta_rev(meta_rev);
        scheme::append_meta_rev_to_ops(&buf, &mut req.success);
        scheme::append_meta_rev_to_ops(&buf, &mut req.failure);

        // Mirror the meta-rev onto the member's clock key along every
        // outcome path.
        req.success.push(scheme::clock_write_op(&buf));
        req.failure.push(scheme::clock_write_op(&buf));

        let mut resp = match member.client.kv.txn(req.clone()).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    key = %String::from_utf8_lossy(&key),
                    meta_rev,
                    error = %err,
                    "error sending txn"
                );
                return Err(err);
            }
        };

        for op in &mut resp.responses {
            match &mut op.response {
                Some(response_op::Response::ResponsePut(p)) => {
                    if let Some(prev) = &mut p.prev_kv {
                        scheme::resolve_mod_rev(prev);
                    }
                    if let Some(header) = &mut p.header {
                        header.revision = meta_rev;
                    }
                }
                Some(response_op::Response::ResponseRange(r)) => {
                    for kv in &mut r.kvs {
                        scheme::resolve_mod_rev(kv);
                    }
                }
                Some(response_op::Response::ResponseDeleteRange(d)) => {
                    for kv in &mut d.prev_kvs {
                        scheme::resolve_mod_rev(kv);
                    }
                    if let Some(header) = &mut d.header {
                        header.revision = meta_rev;
                    }
                }
                None => {}
            }
        }
        resp.header = Some(ResponseHeader {
            revision: meta_rev,
            ..Default::default()
        });

        if resp.succeeded {
            info!(
                key = %String::from_utf8_lossy(&key),
                meta_rev,
                "txn applied successfully"
            );
        } else {
            let cmp_mod_revs: Vec<i64> = req
                .compare
                .iter()
                .map(|cmp| match cmp.target_union {
                    Some(compare::TargetUnion::ModRevision(rev)) => rev,
                    _ => 0,
                })
                .collect();
            warn!(
                key = %String::from_utf8_lossy(&key),
                meta_rev,
                ?cmp_mod_revs,
                "txn failed"
            );
        }
        Ok(resp)
    }

    /// Serve one watch connection.
    ///
    /// The receive loop handles create requests; each accepted watch is
    /// registered on the multiplexer from its own task so a slow backfill
    /// cannot stall the stream. Everything funnels into `outbound`, which
    /// the transport drains to the client. Any failure tears the
    /// connection down.
    pub async fn watch<S>(
        &self,
        mut inbound: S,
        outbound: mpsc::Sender<WatchResponse>,
    ) -> ProxyResult<()>
    where
        S: Stream<Item = ProxyResult<WatchRequest>> + Send + Unpin,
    {
        self.metrics.inc_request(Method::Watch);
        let _connection = self.metrics.watch_connection_guard();

        let id = format!("{:016x}", rand::thread_rng().gen::<u64>());
        info!(watch_id = %id, "starting watch connection");

        let mut registrations: JoinSet<ProxyResult<()>> = JoinSet::new();
        let result = loop {
            tokio::select! {
                msg = inbound.next() => {
                    match msg {
                        None => break Ok(()),
                        Some(Err(err)) => break Err(err),
                        Some(Ok(req)) => {
                            if let Err(err) = self
                                .handle_watch_request(&id, req, &outbound, &mut registrations)
                                .await
                            {
                                break Err(err);
                            }
                        }
                    }
                }
                Some(joined) = registrations.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => break Err(err),
                        Err(err) => break Err(ProxyError::internal(format!(
                            "watch registration task failed: {err}"
                        ))),
                    }
                }
            }
        };

        match &result {
            Ok(()) => info!(watch_id = %id, "closing watch connection"),
            Err(err) => warn!(watch_id = %id, error = %err, "closing watch connection with error"),
        }
        result
    }

    async fn handle_watch_request(
        &self,
        id: &str,
        req: WatchRequest,
        outbound: &mpsc::Sender<WatchResponse>,
        registrations: &mut JoinSet<ProxyResult<()>>,
    ) -> ProxyResult<()> {
        let create = match req.request_union {
            Some(watch_request::RequestUnion::CreateRequest(create)) => create,
            Some(_) => {
                debug!(watch_id = %id, "ignoring non-create watch request");
                return Ok(());
            }
            None => return Ok(()),
        };

        let mut start_rev = create.start_revision;
        if start_rev == 0 {
            start_rev = self.clock.now().await?;
        }

        info!(
            watch_id = %id,
            start_key = %String::from_utf8_lossy(&create.key),
            end_key = %String::from_utf8_lossy(&create.range_end),
            meta_rev = start_rev,
            "adding keyspace to watch connection"
        );

        let mux = self.pool.watch_mux();
        let sink = outbound.clone();
        registrations.spawn(async move {
            if !mux
                .watch(create.key, create.range_end, start_rev, create.watch_id, sink)
                .await
            {
                return Err(ProxyError::StartRevisionTooOld { start_rev });
            }
            Ok(())
        });

        let ack = WatchResponse {
            header: Some(ResponseHeader::default()),
            watch_id: create.watch_id,
            created: true,
            ..Default::default()
        };
        outbound
            .send(ack)
            .await
            .map_err(|_| ProxyError::internal("watch client went away"))?;
        Ok(())
    }

    pub async fn lease_grant(&self, mut req: LeaseGrantRequest) -> ProxyResult<LeaseGrantResponse> {
        self.metrics.inc_request(Method::LeaseGrant);

        if req.id == 0 {
            req.id = rand::thread_rng().gen_range(1..i64::MAX);
        }

        self.pool
            .for_each_member(|member| {
                let req = req.clone();
                async move {
                    let resp = member.client.lease.lease_grant(req).await?;
                    if !resp.error.is_empty() {
                        return Err(ProxyError::LeaseFailed {
                            member: member.name.clone(),
                            message: resp.error,
                        });
                    }
                    Ok(())
                }
            })
            .await?;

        info!(id = req.id, ttl_secs = req.ttl, "granted lease successfully");
        Ok(LeaseGrantResponse {
            header: Some(ResponseHeader::default()),
            id: req.id,
            ttl: req.ttl,
            error: String::new(),
        })
    }

    pub async fn compact(&self, req: CompactionRequest) -> ProxyResult<CompactionResponse> {
        self.metrics.inc_request(Method::Compact);

        self.pool
            .for_each_member(|member| {
                let req = req.clone();
                async move {
                    let mut member_req = req;
                    member_req.revision = self
                        .resolver
                        .member_rev(member.client.kv.as_ref(), member_req.revision)
                        .await?;
                    member.client.kv.compact(member_req).await?;
                    Ok(())
                }
            })
            .await?;

        let coordinator_kv = self.clock.coordinator_kv();
        let mut coordinator_req = req;
        coordinator_req.revision = self
            .resolver
            .member_rev(coordinator_kv.as_ref(), coordinator_req.revision)
            .await?;
        coordinator_kv.compact(coordinator_req).await?;

        Ok(CompactionResponse::default())
    }
}
