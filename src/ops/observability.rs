//! Proxy metrics.
//!
//! In-process counters built from atomics:
//! - `request_count{method}` - requests partitioned by method
//! - `get_member_rev_depth` - histogram of resolver walk depth, a
//!   diagnostic for clock skew between members
//! - `active_watch_count` - currently open watch connections

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Request methods tracked by `request_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Range,
    Watch,
    Txn,
    LeaseGrant,
    Compact,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::Range => "Range",
            Self::Watch => "Watch",
            Self::Txn => "Txn",
            Self::LeaseGrant => "LeaseGrant",
            Self::Compact => "Compact",
        }
    }

    const ALL: [Method; 6] = [
        Method::Get,
        Method::Range,
        Method::Watch,
        Method::Txn,
        Method::LeaseGrant,
        Method::Compact,
    ];
}

/// Bucket upper bounds for the resolver depth histogram. Depth 1 is the
/// common case; anything deeper means the member's clock ran ahead of the
/// requested meta-rev. Values past the last bound land in an overflow
/// slot, so every observation is counted in exactly one bucket.
const DEPTH_BUCKETS: [u64; 6] = [1, 2, 4, 8, 16, 32];

/// Histogram with fixed buckets, an overflow slot, count and sum.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; DEPTH_BUCKETS.len() + 1],
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, value: u64) {
        let slot = DEPTH_BUCKETS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(DEPTH_BUCKETS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn bucket(&self, upper_bound: u64) -> Option<u64> {
        DEPTH_BUCKETS
            .iter()
            .position(|b| *b == upper_bound)
            .map(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    /// Observations beyond the largest configured bound.
    pub fn overflow(&self) -> u64 {
        self.buckets[DEPTH_BUCKETS.len()].load(Ordering::Relaxed)
    }
}

/// Metrics registry for the proxy.
#[derive(Debug, Default)]
pub struct Metrics {
    request_count: [AtomicU64; Method::ALL.len()],
    get_member_rev_depth: Histogram,
    active_watch_count: AtomicI64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_request(&self, method: Method) {
        let idx = Method::ALL.iter().position(|m| *m == method).unwrap_or(0);
        self.request_count[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self, method: Method) -> u64 {
        let idx = Method::ALL.iter().position(|m| *m == method).unwrap_or(0);
        self.request_count[idx].load(Ordering::Relaxed)
    }

    pub fn observe_member_rev_depth(&self, depth: u64) {
        self.get_member_rev_depth.observe(depth);
    }

    pub fn member_rev_depth(&self) -> &Histogram {
        &self.get_member_rev_depth
    }

    pub fn active_watch_count(&self) -> i64 {
        self.active_watch_count.load(Ordering::Relaxed)
    }

    /// RAII guard maintaining `active_watch_count` across a connection.
    pub fn watch_connection_guard(&self) -> WatchConnectionGuard<'_> {
        self.active_watch_count.fetch_add(1, Ordering::Relaxed);
        WatchConnectionGuard { metrics: self }
    }
}

pub struct WatchConnectionGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for WatchConnectionGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active_watch_count.fetch_sub(1, Ordering::Relaxed);
    }
}
