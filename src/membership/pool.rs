//! Member pool: the key-to-member directory and the fan-out primitive.
//!
//! The pool is read-only after construction. A key no member owns yields
//! `None` rather than a panic, since members may be introduced at runtime
//! by future directory sources.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use crate::core::error::{ProxyError, ProxyResult};
use crate::membership::client::ClientSet;
use crate::proto::WatchResponse;

/// Watch multiplexer capability.
///
/// Implementations merge per-member watch streams into one meta-rev-ordered
/// stream per key range. `watch` returns false when `start_rev` is older
/// than the multiplexer's retention window.
#[async_trait]
pub trait WatchMux: Send + Sync {
    async fn watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_rev: i64,
        watch_id: i64,
        sink: mpsc::Sender<WatchResponse>,
    ) -> bool;
}

/// Keyspace predicate: a list of owned prefixes. The empty prefix matches
/// everything, making the member a catch-all.
#[derive(Debug, Clone, Default)]
pub struct KeySelector {
    prefixes: Vec<Vec<u8>>,
}

impl KeySelector {
    pub fn new(prefixes: Vec<Vec<u8>>) -> Self {
        Self { prefixes }
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// One member of the federation.
#[derive(Debug)]
pub struct Member {
    pub name: String,
    pub selector: KeySelector,
    pub client: ClientSet,
}

/// Read-only directory of members plus the watch multiplexer capability.
pub struct Pool {
    members: Vec<Arc<Member>>,
    mux: Arc<dyn WatchMux>,
}

impl Pool {
    pub fn new(members: Vec<Member>, mux: Arc<dyn WatchMux>) -> Self {
        Self {
            members: members.into_iter().map(Arc::new).collect(),
            mux,
        }
    }

    /// The member owning `key`, or `None` when no selector matches.
    pub fn member_for_key(&self, key: &[u8]) -> Option<Arc<Member>> {
        self.members
            .iter()
            .find(|m| m.selector.matches(key))
            .cloned()
    }

    pub fn members(&self) -> &[Arc<Member>] {
        &self.members
    }

    pub fn watch_mux(&self) -> Arc<dyn WatchMux> {
        self.mux.clone()
    }

    /// Run `f` against every member in parallel. The first error aborts the
    /// fan-out; dropping the remaining futures cancels the siblings.
    pub async fn for_each_member<F, Fut>(&self, f: F) -> ProxyResult<()>
    where
        F: Fn(Arc<Member>) -> Fut,
        Fut: std::future::Future<Output = ProxyResult<()>> + Send,
    {
        let mut futs: FuturesUnordered<_> = self.members.iter().cloned().map(f).collect();
        while let Some(result) = futs.next().await {
            result?;
        }
        Ok(())
    }
}

/// Surface a missing owner as an error at call sites.
pub fn require_member(member: Option<Arc<Member>>, key: &[u8]) -> ProxyResult<Arc<Member>> {
    member.ok_or_else(|| ProxyError::InvalidRequest {
        message: format!("no member owns key {:?}", String::from_utf8_lossy(key)),
    })
}
