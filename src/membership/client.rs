//! Member client capabilities.
//!
//! The KV, Watch and Lease surfaces of one member cluster, captured as
//! trait objects so the translation layer, the clock and the tests can all
//! supply their own transports.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::core::error::ProxyResult;
use crate::proto::{
    CompactionRequest, CompactionResponse, LeaseGrantRequest, LeaseGrantResponse,
    LeaseKeepAliveRequest, LeaseKeepAliveResponse, PutRequest, PutResponse, RangeRequest,
    RangeResponse, TxnRequest, TxnResponse, WatchCreateRequest, WatchResponse,
};

/// KV surface of a member or the coordinator.
#[async_trait]
pub trait KvApi: Send + Sync {
    async fn range(&self, req: RangeRequest) -> ProxyResult<RangeResponse>;
    async fn put(&self, req: PutRequest) -> ProxyResult<PutResponse>;
    async fn txn(&self, req: TxnRequest) -> ProxyResult<TxnResponse>;
    async fn compact(&self, req: CompactionRequest) -> ProxyResult<CompactionResponse>;
}

/// Watch surface of a member. The returned stream carries the member's raw
/// responses; meta-rev resolution happens in the multiplexer feed.
#[async_trait]
pub trait WatchApi: Send + Sync {
    async fn watch(
        &self,
        create: WatchCreateRequest,
    ) -> ProxyResult<BoxStream<'static, ProxyResult<WatchResponse>>>;
}

/// Lease surface of a member.
#[async_trait]
pub trait LeaseApi: Send + Sync {
    async fn lease_grant(&self, req: LeaseGrantRequest) -> ProxyResult<LeaseGrantResponse>;

    /// Refresh a lease's time-to-live. Fails when the lease has already
    /// expired or was never granted.
    async fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> ProxyResult<LeaseKeepAliveResponse>;
}

/// The capability set for one member cluster.
#[derive(Clone)]
pub struct ClientSet {
    pub kv: Arc<dyn KvApi>,
    pub watch: Arc<dyn WatchApi>,
    pub lease: Arc<dyn LeaseApi>,
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSet").finish_non_exhaustive()
    }
}

impl ClientSet {
    pub fn new(kv: Arc<dyn KvApi>, watch: Arc<dyn WatchApi>, lease: Arc<dyn LeaseApi>) -> Self {
        Self { kv, watch, lease }
    }

    /// Read a single key at the member's current revision.
    pub async fn get(&self, key: &[u8]) -> ProxyResult<RangeResponse> {
        self.kv
            .range(RangeRequest {
                key: key.to_vec(),
                ..Default::default()
            })
            .await
    }
}
