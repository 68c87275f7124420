//! gRPC-backed member client.
//!
//! Implements the member capability traits over a lazily-connected tonic
//! channel, using the in-crate proto types with `ProstCodec`. The same
//! no-codegen approach as the server side.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::core::error::{self, ProxyError, ProxyResult};
use crate::membership::client::{ClientSet, KvApi, LeaseApi, WatchApi};
use crate::proto::{
    watch_request, CompactionRequest, CompactionResponse, LeaseGrantRequest, LeaseGrantResponse,
    LeaseKeepAliveRequest, LeaseKeepAliveResponse, PutRequest, PutResponse, RangeRequest,
    RangeResponse, TxnRequest, TxnResponse, WatchCreateRequest, WatchRequest, WatchResponse,
};

/// One member (or the coordinator) reached over gRPC.
pub struct GrpcMember {
    name: String,
    channel: Channel,
}

impl GrpcMember {
    /// Create a client for `endpoint`. The connection is established lazily
    /// on first use, so construction never blocks startup on a dead member.
    pub fn connect(
        name: impl Into<String>,
        endpoint: &str,
        tls: Option<ClientTlsConfig>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut ep = Endpoint::from_shared(endpoint.to_string())?;
        if let Some(tls) = tls {
            ep = ep.tls_config(tls)?;
        }
        Ok(Arc::new(Self {
            name: name.into(),
            channel: ep.connect_lazy(),
        }))
    }

    /// The full capability set backed by this connection.
    pub fn client_set(self: &Arc<Self>) -> ClientSet {
        ClientSet::new(self.clone(), self.clone(), self.clone())
    }

    async fn unary<M1, M2>(&self, path: &'static str, req: M1) -> ProxyResult<M2>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ProxyError::unavailable(&self.name, e))?;
        let codec: ProstCodec<M1, M2> = ProstCodec::default();
        let resp = grpc
            .unary(
                tonic::Request::new(req),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|status| error::from_status(&self.name, status))?;
        Ok(resp.into_inner())
    }
}

#[async_trait]
impl KvApi for GrpcMember {
    async fn range(&self, req: RangeRequest) -> ProxyResult<RangeResponse> {
        self.unary("/etcdserverpb.KV/Range", req).await
    }

    async fn put(&self, req: PutRequest) -> ProxyResult<PutResponse> {
        self.unary("/etcdserverpb.KV/Put", req).await
    }

    async fn txn(&self, req: TxnRequest) -> ProxyResult<TxnResponse> {
        self.unary("/etcdserverpb.KV/Txn", req).await
    }

    async fn compact(&self, req: CompactionRequest) -> ProxyResult<CompactionResponse> {
        self.unary("/etcdserverpb.KV/Compact", req).await
    }
}

#[async_trait]
impl WatchApi for GrpcMember {
    async fn watch(
        &self,
        create: WatchCreateRequest,
    ) -> ProxyResult<BoxStream<'static, ProxyResult<WatchResponse>>> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ProxyError::unavailable(&self.name, e))?;

        let codec: ProstCodec<WatchRequest, WatchResponse> = ProstCodec::default();
        // One create request, then hold the stream open.
        let outbound = futures_util::stream::iter([WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(create)),
        }])
        .chain(futures_util::stream::pending());

        let resp = grpc
            .streaming(
                tonic::Request::new(outbound),
                PathAndQuery::from_static("/etcdserverpb.Watch/Watch"),
                codec,
            )
            .await
            .map_err(|status| error::from_status(&self.name, status))?;

        let name = self.name.clone();
        let stream = resp
            .into_inner()
            .map(move |item| item.map_err(|status| error::from_status(&name, status)));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl LeaseApi for GrpcMember {
    async fn lease_grant(&self, req: LeaseGrantRequest) -> ProxyResult<LeaseGrantResponse> {
        self.unary("/etcdserverpb.Lease/LeaseGrant", req).await
    }

    async fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> ProxyResult<LeaseKeepAliveResponse> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ProxyError::unavailable(&self.name, e))?;

        // LeaseKeepAlive is a bidi stream upstream; one refresh is a single
        // request/response exchange on a short-lived stream.
        let codec: ProstCodec<LeaseKeepAliveRequest, LeaseKeepAliveResponse> =
            ProstCodec::default();
        let resp = grpc
            .streaming(
                tonic::Request::new(futures_util::stream::iter([req])),
                PathAndQuery::from_static("/etcdserverpb.Lease/LeaseKeepAlive"),
                codec,
            )
            .await
            .map_err(|status| error::from_status(&self.name, status))?;

        let mut replies = resp.into_inner();
        match replies
            .message()
            .await
            .map_err(|status| error::from_status(&self.name, status))?
        {
            Some(reply) => Ok(reply),
            None => Err(ProxyError::unavailable(
                &self.name,
                "keepalive stream closed without a reply",
            )),
        }
    }
}
