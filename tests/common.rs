#![allow(dead_code)]

//! Common test utilities.
//!
//! The heart of the harness is `MemStore`, an in-memory MVCC store with
//! etcd-shaped semantics: one revision per transaction, per-key version
//! counters, read-as-of, ignore-value puts, compare guards and watch
//! events. One instance stands in for the coordinator and one for each
//! member, so the proxy is exercised end-to-end without a network.
//!
//! Import with `mod common;` in test files.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use trellis::clock::MetaClock;
use trellis::error::{ProxyError, ProxyResult};
use trellis::membership::client::{ClientSet, KvApi, LeaseApi, WatchApi};
use trellis::membership::coordinator::CoordinatorClient;
use trellis::membership::pool::{KeySelector, Member, Pool};
use trellis::ops::observability::Metrics;
use trellis::proto::*;
use trellis::proxy::ProxyServer;
use trellis::watchmux::{MemberFeed, WatchHub};

/// One stored version of a key. `value: None` is a tombstone.
#[derive(Debug, Clone)]
struct VersionRec {
    mod_revision: i64,
    create_revision: i64,
    version: i64,
    value: Option<Vec<u8>>,
    lease: i64,
}

struct StoreInner {
    revision: i64,
    compacted: i64,
    keys: BTreeMap<Vec<u8>, Vec<VersionRec>>,
    leases: HashMap<i64, i64>,
    next_lease_id: i64,
    lease_error: Option<String>,
    history: Vec<(i64, Vec<Event>)>,
    watchers: Vec<mpsc::UnboundedSender<WatchResponse>>,
}

/// In-memory MVCC store with etcd-shaped semantics.
pub struct MemStore {
    name: String,
    inner: Mutex<StoreInner>,
}

fn in_range(key: &[u8], range_end: &[u8], candidate: &[u8]) -> bool {
    if range_end.is_empty() {
        candidate == key
    } else if range_end == [0] {
        candidate >= key
    } else {
        candidate >= key && candidate < range_end
    }
}

fn live_at(recs: &[VersionRec], at: i64) -> Option<&VersionRec> {
    recs.iter()
        .rev()
        .find(|r| r.mod_revision <= at)
        .filter(|r| r.value.is_some())
}

fn to_kv(key: &[u8], rec: &VersionRec) -> KeyValue {
    KeyValue {
        key: key.to_vec(),
        create_revision: rec.create_revision,
        mod_revision: rec.mod_revision,
        version: rec.version,
        value: rec.value.clone().unwrap_or_default(),
        lease: rec.lease,
    }
}

impl MemStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(StoreInner {
                // An empty etcd store already reports revision 1.
                revision: 1,
                compacted: 0,
                keys: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease_id: 1000,
                lease_error: None,
                history: Vec::new(),
                watchers: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every subsequent lease grant fail with `message`.
    pub fn fail_lease_grants(&self, message: impl Into<String>) {
        self.inner.lock().lease_error = Some(message.into());
    }

    pub fn current_revision(&self) -> i64 {
        self.inner.lock().revision
    }

    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// The live kv for `key` as stored, suffix and all. Bypasses the proxy.
    pub fn raw_get(&self, key: &[u8]) -> Option<KeyValue> {
        let inner = self.inner.lock();
        let recs = inner.keys.get(key)?;
        let rec = recs.last().filter(|r| r.value.is_some())?;
        Some(to_kv(key, rec))
    }

    /// Delete `key` out from under the proxy (no clock write, no suffix).
    pub fn raw_delete(&self, key: &[u8]) {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        let rev = inner.revision;
        if let Some(recs) = inner.keys.get_mut(key) {
            recs.push(VersionRec {
                mod_revision: rev,
                create_revision: 0,
                version: 0,
                value: None,
                lease: 0,
            });
        }
    }

    /// Number of live keys, the clock mirror included.
    pub fn live_key_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .keys
            .values()
            .filter(|recs| recs.last().map(|r| r.value.is_some()).unwrap_or(false))
            .count()
    }

    fn eval_compare(inner: &StoreInner, cmp: &Compare) -> bool {
        let zero = VersionRec {
            mod_revision: 0,
            create_revision: 0,
            version: 0,
            value: Some(Vec::new()),
            lease: 0,
        };
        let rec = inner
            .keys
            .get(&cmp.key)
            .and_then(|recs| recs.last())
            .filter(|r| r.value.is_some())
            .cloned()
            .unwrap_or(zero);

        let result =
            compare::CompareResult::try_from(cmp.result).unwrap_or(compare::CompareResult::Equal);
        let ord = match &cmp.target_union {
            Some(compare::TargetUnion::Version(v)) => rec.version.cmp(v),
            Some(compare::TargetUnion::CreateRevision(v)) => rec.create_revision.cmp(v),
            Some(compare::TargetUnion::ModRevision(v)) => rec.mod_revision.cmp(v),
            Some(compare::TargetUnion::Lease(v)) => rec.lease.cmp(v),
            Some(compare::TargetUnion::Value(v)) => {
                rec.value.clone().unwrap_or_default().cmp(v)
            }
            None => std::cmp::Ordering::Equal,
        };
        match result {
            compare::CompareResult::Equal => ord.is_eq(),
            compare::CompareResult::Greater => ord.is_gt(),
            compare::CompareResult::Less => ord.is_lt(),
            compare::CompareResult::NotEqual => !ord.is_eq(),
        }
    }

    fn range_locked(inner: &StoreInner, req: &RangeRequest) -> ProxyResult<RangeResponse> {
        let at = if req.revision > 0 {
            req.revision
        } else {
            inner.revision
        };
        if req.revision > inner.revision {
            return Err(ProxyError::internal(format!(
                "future revision {} requested, store at {}",
                req.revision, inner.revision
            )));
        }
        if at < inner.compacted {
            return Err(ProxyError::RevisionCompacted { revision: at });
        }

        let mut kvs = Vec::new();
        for (key, recs) in &inner.keys {
            if !in_range(&req.key, &req.range_end, key) {
                continue;
            }
            if let Some(rec) = live_at(recs, at) {
                kvs.push(to_kv(key, rec));
            }
        }
        let count = kvs.len() as i64;
        let mut more = false;
        if req.limit > 0 && kvs.len() as i64 > req.limit {
            kvs.truncate(req.limit as usize);
            more = true;
        }
        if req.count_only {
            kvs.clear();
        }

        Ok(RangeResponse {
            header: Some(ResponseHeader {
                revision: inner.revision,
                ..Default::default()
            }),
            kvs,
            more,
            count,
        })
    }

    fn txn_locked(inner: &mut StoreInner, req: &TxnRequest) -> ProxyResult<TxnResponse> {
        let succeeded = req.compare.iter().all(|cmp| Self::eval_compare(inner, cmp));
        let ops = if succeeded { &req.success } else { &req.failure };

        // etcd rejects an ignore-value put of a missing key before applying
        // anything.
        for op in ops {
            if let Some(request_op::Request::RequestPut(put)) = &op.request {
                if put.ignore_value {
                    let exists = inner
                        .keys
                        .get(&put.key)
                        .and_then(|recs| recs.last())
                        .map(|r| r.value.is_some())
                        .unwrap_or(false);
                    if !exists {
                        return Err(ProxyError::KeyNotFound);
                    }
                }
            }
        }

        let has_write = ops.iter().any(|op| {
            matches!(
                op.request,
                Some(request_op::Request::RequestPut(_))
                    | Some(request_op::Request::RequestDeleteRange(_))
            )
        });
        let new_rev = inner.revision + i64::from(has_write);
        let mut events = Vec::new();
        let mut responses = Vec::new();

        for op in ops {
            match &op.request {
                Some(request_op::Request::RequestRange(range)) => {
                    // Reads inside a txn see its earlier writes; fake the
                    // frontier by treating new_rev as readable.
                    let saved = inner.revision;
                    inner.revision = new_rev;
                    let result = Self::range_locked(inner, range);
                    inner.revision = saved;
                    responses.push(ResponseOp {
                        response: Some(response_op::Response::ResponseRange(result?)),
                    });
                }
                Some(request_op::Request::RequestPut(put)) => {
                    let prev = inner
                        .keys
                        .get(&put.key)
                        .and_then(|recs| recs.last())
                        .filter(|r| r.value.is_some())
                        .cloned();
                    let prev_kv = if put.prev_kv {
                        prev.as_ref().map(|rec| to_kv(&put.key, rec))
                    } else {
                        None
                    };
                    let rec = VersionRec {
                        mod_revision: new_rev,
                        create_revision: prev
                            .as_ref()
                            .map(|p| p.create_revision)
                            .unwrap_or(new_rev),
                        version: prev.as_ref().map(|p| p.version).unwrap_or(0) + 1,
                        value: Some(if put.ignore_value {
                            prev.as_ref()
                                .and_then(|p| p.value.clone())
                                .unwrap_or_default()
                        } else {
                            put.value.clone()
                        }),
                        lease: if put.ignore_lease {
                            prev.as_ref().map(|p| p.lease).unwrap_or(0)
                        } else {
                            put.lease
                        },
                    };
                    events.push(Event {
                        r#type: event::EventType::Put as i32,
                        kv: Some(to_kv(&put.key, &rec)),
                        prev_kv: None,
                    });
                    inner.keys.entry(put.key.clone()).or_default().push(rec);
                    responses.push(ResponseOp {
                        response: Some(response_op::Response::ResponsePut(PutResponse {
                            header: Some(ResponseHeader {
                                revision: new_rev,
                                ..Default::default()
                            }),
                            prev_kv,
                        })),
                    });
                }
                Some(request_op::Request::RequestDeleteRange(del)) => {
                    let targets: Vec<Vec<u8>> = inner
                        .keys
                        .iter()
                        .filter(|(k, recs)| {
                            in_range(&del.key, &del.range_end, k)
                                && recs.last().map(|r| r.value.is_some()).unwrap_or(false)
                        })
                        .map(|(k, _)| k.clone())
                        .collect();
                    let mut prev_kvs = Vec::new();
                    for key in &targets {
                        let recs = inner.keys.get_mut(key).expect("target key exists");
                        if del.prev_kv {
                            if let Some(rec) = recs.last().filter(|r| r.value.is_some()) {
                                prev_kvs.push(to_kv(key, rec));
                            }
                        }
                        recs.push(VersionRec {
                            mod_revision: new_rev,
                            create_revision: 0,
                            version: 0,
                            value: None,
                            lease: 0,
                        });
                        events.push(Event {
                            r#type: event::EventType::Delete as i32,
                            kv: Some(KeyValue {
                                key: key.clone(),
                                mod_revision: new_rev,
                                ..Default::default()
                            }),
                            prev_kv: None,
                        });
                    }
                    responses.push(ResponseOp {
                        response: Some(response_op::Response::ResponseDeleteRange(
                            DeleteRangeResponse {
                                header: Some(ResponseHeader {
                                    revision: new_rev,
                                    ..Default::default()
                                }),
                                deleted: targets.len() as i64,
                                prev_kvs,
                            },
                        )),
                    });
                }
                None => responses.push(ResponseOp { response: None }),
            }
        }

        if has_write {
            inner.revision = new_rev;
            inner.history.push((new_rev, events.clone()));
            let resp = WatchResponse {
                header: Some(ResponseHeader {
                    revision: new_rev,
                    ..Default::default()
                }),
                events,
                ..Default::default()
            };
            inner.watchers.retain(|w| w.send(resp.clone()).is_ok());
        }

        Ok(TxnResponse {
            header: Some(ResponseHeader {
                revision: inner.revision,
                ..Default::default()
            }),
            succeeded,
            responses,
        })
    }
}

#[async_trait]
impl KvApi for MemStore {
    async fn range(&self, req: RangeRequest) -> ProxyResult<RangeResponse> {
        Self::range_locked(&self.inner.lock(), &req)
    }

    async fn put(&self, req: PutRequest) -> ProxyResult<PutResponse> {
        let resp = Self::txn_locked(
            &mut self.inner.lock(),
            &TxnRequest {
                success: vec![put_op(req)],
                ..Default::default()
            },
        )?;
        match resp.responses.into_iter().next() {
            Some(ResponseOp {
                response: Some(response_op::Response::ResponsePut(put)),
            }) => Ok(put),
            _ => Err(ProxyError::internal("put yielded no response")),
        }
    }

    async fn txn(&self, req: TxnRequest) -> ProxyResult<TxnResponse> {
        Self::txn_locked(&mut self.inner.lock(), &req)
    }

    async fn compact(&self, req: CompactionRequest) -> ProxyResult<CompactionResponse> {
        let mut inner = self.inner.lock();
        if req.revision > inner.revision {
            return Err(ProxyError::internal(format!(
                "cannot compact future revision {}",
                req.revision
            )));
        }
        inner.compacted = inner.compacted.max(req.revision);
        let floor = inner.compacted;
        for recs in inner.keys.values_mut() {
            while recs.len() > 1 && recs[1].mod_revision <= floor {
                recs.remove(0);
            }
        }
        Ok(CompactionResponse {
            header: Some(ResponseHeader {
                revision: inner.revision,
                ..Default::default()
            }),
        })
    }
}

#[async_trait]
impl WatchApi for MemStore {
    async fn watch(
        &self,
        create: WatchCreateRequest,
    ) -> ProxyResult<BoxStream<'static, ProxyResult<WatchResponse>>> {
        let mut inner = self.inner.lock();
        let replay: Vec<WatchResponse> = inner
            .history
            .iter()
            .filter(|(rev, _)| *rev >= create.start_revision)
            .map(|(rev, events)| {
                let matched: Vec<Event> = events
                    .iter()
                    .filter(|ev| {
                        ev.kv
                            .as_ref()
                            .map(|kv| in_range(&create.key, &create.range_end, &kv.key))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                WatchResponse {
                    header: Some(ResponseHeader {
                        revision: *rev,
                        ..Default::default()
                    }),
                    events: matched,
                    ..Default::default()
                }
            })
            .filter(|resp| !resp.events.is_empty())
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(tx);

        let stream = futures_util::stream::iter(replay)
            .chain(UnboundedReceiverStream::new(rx))
            .map(Ok);
        Ok(stream.boxed())
    }
}

#[async_trait]
impl LeaseApi for MemStore {
    async fn lease_grant(&self, req: LeaseGrantRequest) -> ProxyResult<LeaseGrantResponse> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.lease_error.clone() {
            return Ok(LeaseGrantResponse {
                header: Some(ResponseHeader::default()),
                id: req.id,
                ttl: req.ttl,
                error: message,
            });
        }
        let id = if req.id != 0 {
            req.id
        } else {
            inner.next_lease_id += 1;
            inner.next_lease_id
        };
        inner.leases.insert(id, req.ttl);
        Ok(LeaseGrantResponse {
            header: Some(ResponseHeader::default()),
            id,
            ttl: req.ttl,
            error: String::new(),
        })
    }

    async fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> ProxyResult<LeaseKeepAliveResponse> {
        let inner = self.inner.lock();
        match inner.leases.get(&req.id) {
            Some(ttl) => Ok(LeaseKeepAliveResponse {
                header: Some(ResponseHeader::default()),
                id: req.id,
                ttl: *ttl,
            }),
            None => Err(ProxyError::KeyNotFound),
        }
    }
}

/// A fully wired in-memory federation.
pub struct Cluster {
    pub proxy: Arc<ProxyServer>,
    pub coordinator: CoordinatorClient,
    pub coordinator_store: Arc<MemStore>,
    pub members: Vec<Arc<MemStore>>,
    pub pool: Arc<Pool>,
    pub hub: Arc<WatchHub>,
    pub metrics: Arc<Metrics>,
}

impl Cluster {
    /// A fresh MetaClock over the same coordinator and pool, for tests
    /// that drive the clock directly.
    pub fn clock(&self) -> MetaClock {
        MetaClock::new(self.coordinator.clone(), self.pool.clone())
    }

    pub fn member(&self, name: &str) -> &Arc<MemStore> {
        self.members
            .iter()
            .find(|m| m.name() == name)
            .expect("unknown member name")
    }
}

/// Build a cluster with the given members and their owned prefixes, with
/// member feeds pumping the watch hub.
pub fn cluster(members: &[(&str, &[&str])]) -> Cluster {
    let coordinator_store = MemStore::new("coordinator");
    let coordinator = CoordinatorClient::new(
        coordinator_store.clone() as Arc<dyn KvApi>,
        coordinator_store.clone() as Arc<dyn LeaseApi>,
    );

    let hub = WatchHub::new(64);
    let mut stores = Vec::new();
    let mut pool_members = Vec::new();
    for (name, prefixes) in members {
        let store = MemStore::new(*name);
        let client = ClientSet::new(
            store.clone() as Arc<dyn KvApi>,
            store.clone() as Arc<dyn WatchApi>,
            store.clone() as Arc<dyn LeaseApi>,
        );
        tokio::spawn(
            MemberFeed::new(*name, hub.clone()).run(client.watch.clone(), client.kv.clone()),
        );
        pool_members.push(Member {
            name: name.to_string(),
            selector: KeySelector::new(prefixes.iter().map(|p| p.as_bytes().to_vec()).collect()),
            client,
        });
        stores.push(store);
    }

    let pool = Arc::new(Pool::new(pool_members, hub.clone()));
    let clock = MetaClock::new(coordinator.clone(), pool.clone());
    let metrics = Metrics::new();
    let proxy = Arc::new(ProxyServer::new(clock, pool.clone(), metrics.clone()));

    Cluster {
        proxy,
        coordinator,
        coordinator_store,
        members: stores,
        pool,
        hub,
        metrics,
    }
}

/// The default two-member layout: m1 owns "a", m2 owns "b", m2 is also the
/// catch-all for everything else.
pub fn two_member_cluster() -> Cluster {
    cluster(&[("m1", &["a"]), ("m2", &["b", ""])])
}

/// Put `key`/`value` through the proxy and return the write's meta-rev.
pub async fn proxy_put(cluster: &Cluster, key: &[u8], value: &[u8]) -> i64 {
    let resp = cluster
        .proxy
        .txn(TxnRequest {
            success: vec![put_op(PutRequest {
                key: key.to_vec(),
                value: value.to_vec(),
                ..Default::default()
            })],
            ..Default::default()
        })
        .await
        .expect("proxy put failed");
    assert!(resp.succeeded);
    resp.header.expect("txn response carries a header").revision
}

/// Get a single key through the proxy.
pub async fn proxy_get(cluster: &Cluster, key: &[u8]) -> RangeResponse {
    cluster
        .proxy
        .range(RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        })
        .await
        .expect("proxy get failed")
}
