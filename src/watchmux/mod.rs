//! Watch multiplexing.
//!
//! Members emit watch events in their own revision spaces; the hub merges
//! them into one stream per key range, ordered by meta-revision. Each
//! member feed opens a full-keyspace watch on its member, uses the clock
//! key's write in every transaction to learn the meta-rev, rewrites the
//! data events to carry it, and publishes the batch into the hub.
//!
//! The hub keeps a bounded ring of delivered batches so a watch may start
//! in the recent past; a start revision older than the ring's horizon is
//! rejected and surfaces to the client as a too-old error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::membership::pool::WatchMux;
use crate::proto::{event, Event, ResponseHeader, WatchCreateRequest, WatchResponse};
use crate::scheme;

/// One delivered batch: all data events of a single write transaction.
#[derive(Debug, Clone)]
struct EventBatch {
    meta_rev: i64,
    events: Vec<Event>,
}

struct Registration {
    key: Vec<u8>,
    range_end: Vec<u8>,
    watch_id: i64,
    next_rev: i64,
    sink: mpsc::Sender<WatchResponse>,
}

impl Registration {
    fn matches(&self, event_key: &[u8]) -> bool {
        if self.range_end.is_empty() {
            event_key == self.key.as_slice()
        } else if self.range_end == [0] {
            event_key >= self.key.as_slice()
        } else {
            event_key >= self.key.as_slice() && event_key < self.range_end.as_slice()
        }
    }
}

struct HubInner {
    ring: VecDeque<EventBatch>,
    /// Highest meta-rev that has been evicted from the ring; replay below
    /// this point is impossible.
    evicted_through: i64,
    watches: Vec<Registration>,
}

/// Meta-rev-ordered fan-out of member events to watch sinks.
pub struct WatchHub {
    retention: usize,
    inner: Mutex<HubInner>,
}

impl WatchHub {
    pub fn new(retention: usize) -> Arc<Self> {
        Arc::new(Self {
            retention: retention.max(1),
            inner: Mutex::new(HubInner {
                ring: VecDeque::new(),
                evicted_through: 0,
                watches: Vec::new(),
            }),
        })
    }

    /// Deliver one transaction's events at `meta_rev` to every matching
    /// watch and retain the batch for replay.
    pub async fn publish(&self, meta_rev: i64, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;

        let batch = EventBatch { meta_rev, events };
        deliver(&mut inner.watches, &batch).await;

        // Keep the ring sorted; member feeds race each other, so a batch
        // may arrive behind a higher meta-rev from another member.
        let at = inner
            .ring
            .partition_point(|b| b.meta_rev <= batch.meta_rev);
        inner.ring.insert(at, batch);
        while inner.ring.len() > self.retention {
            if let Some(evicted) = inner.ring.pop_front() {
                inner.evicted_through = inner.evicted_through.max(evicted.meta_rev);
            }
        }
    }
}

async fn deliver(watches: &mut Vec<Registration>, batch: &EventBatch) {
    let mut stale = Vec::new();
    for (i, reg) in watches.iter_mut().enumerate() {
        if batch.meta_rev < reg.next_rev {
            continue;
        }
        let matched: Vec<Event> = batch
            .events
            .iter()
            .filter(|ev| {
                ev.kv
                    .as_ref()
                    .map(|kv| reg.matches(&kv.key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if matched.is_empty() {
            continue;
        }
        reg.next_rev = batch.meta_rev + 1;
        let resp = WatchResponse {
            header: Some(ResponseHeader {
                revision: batch.meta_rev,
                ..Default::default()
            }),
            watch_id: reg.watch_id,
            events: matched,
            ..Default::default()
        };
        if reg.sink.send(resp).await.is_err() {
            stale.push(i);
        }
    }
    for i in stale.into_iter().rev() {
        watches.remove(i);
    }
}

#[async_trait]
impl WatchMux for WatchHub {
    async fn watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_rev: i64,
        watch_id: i64,
        sink: mpsc::Sender<WatchResponse>,
    ) -> bool {
        let mut inner = self.inner.lock().await;

        if start_rev > 0 && start_rev <= inner.evicted_through {
            debug!(
                start_rev,
                evicted_through = inner.evicted_through,
                "rejecting watch older than retention window"
            );
            return false;
        }

        let mut reg = Registration {
            key,
            range_end,
            watch_id,
            next_rev: start_rev,
            sink,
        };

        // Replay retained history the watch is entitled to.
        let replay: Vec<EventBatch> = inner
            .ring
            .iter()
            .filter(|b| b.meta_rev >= start_rev)
            .cloned()
            .collect();
        for batch in &replay {
            let mut one = vec![reg];
            deliver(&mut one, batch).await;
            match one.pop() {
                Some(r) => reg = r,
                // The client went away during replay; nothing to register.
                None => return true,
            }
        }

        inner.watches.push(reg);
        true
    }
}

/// Pumps one member's raw watch stream into the hub.
///
/// The feed watches the member's entire keyspace starting just past its
/// current revision. Every proxy write carries a clock-key put, which is
/// the batch's meta-rev; batches without one were written around the proxy
/// and are skipped.
pub struct MemberFeed {
    member_name: String,
    hub: Arc<WatchHub>,
}

impl MemberFeed {
    pub fn new(member_name: impl Into<String>, hub: Arc<WatchHub>) -> Self {
        Self {
            member_name: member_name.into(),
            hub,
        }
    }

    /// Run forever, reconnecting with a fixed backoff on stream failure.
    pub async fn run(
        self,
        watch: Arc<dyn crate::membership::client::WatchApi>,
        kv: Arc<dyn crate::membership::client::KvApi>,
    ) {
        loop {
            if let Err(err) = self.feed_once(watch.as_ref(), kv.as_ref()).await {
                warn!(member = %self.member_name, error = %err, "member watch feed failed, reconnecting");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn feed_once(
        &self,
        watch: &dyn crate::membership::client::WatchApi,
        kv: &dyn crate::membership::client::KvApi,
    ) -> crate::core::error::ProxyResult<()> {
        let head = kv
            .range(crate::proto::RangeRequest {
                key: scheme::CLOCK_KEY.to_vec(),
                ..Default::default()
            })
            .await?;
        let start = head.header.map(|h| h.revision).unwrap_or_default() + 1;

        let mut stream = watch
            .watch(WatchCreateRequest {
                key: vec![0],
                range_end: vec![0],
                start_revision: start,
                ..Default::default()
            })
            .await?;

        while let Some(resp) = stream.next().await {
            let resp = resp?;
            if let Some((meta_rev, events)) = resolve_member_batch(resp.events) {
                self.hub.publish(meta_rev, events).await;
            }
        }
        Ok(())
    }
}

/// Translate one member transaction's raw events into meta-rev space.
///
/// Returns the batch's meta-rev (taken from the clock-key write) and the
/// data events with suffixes stripped and mod-revisions rewritten. `None`
/// when the batch carries no clock write.
pub fn resolve_member_batch(events: Vec<Event>) -> Option<(i64, Vec<Event>)> {
    let meta_rev = events.iter().find_map(|ev| {
        let kv = ev.kv.as_ref()?;
        if kv.key == scheme::CLOCK_KEY {
            scheme::decode_meta_rev(&kv.value)
        } else {
            None
        }
    })?;

    let data: Vec<Event> = events
        .into_iter()
        .filter(|ev| {
            ev.kv
                .as_ref()
                .map(|kv| kv.key != scheme::CLOCK_KEY)
                .unwrap_or(false)
        })
        .map(|mut ev| {
            if let Some(kv) = &mut ev.kv {
                if ev.r#type == event::EventType::Delete as i32 {
                    kv.mod_revision = meta_rev;
                } else {
                    scheme::resolve_mod_rev(kv);
                }
            }
            if let Some(prev) = &mut ev.prev_kv {
                scheme::resolve_mod_rev(prev);
            }
            ev
        })
        .collect();

    Some((meta_rev, data))
}
