//! Client-facing gRPC surface.
//!
//! Serves the etcd v3 wire protocol with tonic. The services route paths
//! by hand against the in-crate proto types (no codegen): unary calls
//! collect the request body, decode, and hand off to the translation
//! layer; Watch bridges the bidirectional stream through channels so the
//! translation layer only sees a stream of requests and a sink of
//! responses.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::{header, HeaderMap, StatusCode};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::Status;

use crate::core::config::ListenerConfig;
use crate::core::error::{self, ProxyError};
use crate::proto;
use crate::proxy::server::ProxyServer;

/// Unwrap one message from its gRPC framing.
///
/// Each message rides behind a five-byte prefix: a compression flag (never
/// negotiated here, so ignored) and a big-endian payload length.
#[allow(clippy::result_large_err)]
fn decode_grpc_message<M: Message + Default>(framed: &Bytes) -> Result<M, Status> {
    let Some(payload) = framed.get(5..) else {
        return Err(Status::invalid_argument("incomplete gRPC frame prefix"));
    };
    let declared =
        u32::from_be_bytes(framed[1..5].try_into().expect("four length bytes")) as usize;
    if declared > payload.len() {
        return Err(Status::invalid_argument(format!(
            "gRPC frame declares {} payload bytes but carries {}",
            declared,
            payload.len()
        )));
    }
    M::decode(&payload[..declared])
        .map_err(|e| Status::invalid_argument(format!("undecodable message: {}", e)))
}

/// Wrap one message in gRPC framing.
fn encode_grpc_message<M: Message>(msg: &M) -> Bytes {
    let payload_len = msg.encoded_len();
    let mut framed = BytesMut::with_capacity(5 + payload_len);
    framed.put_u8(0); // uncompressed
    framed.put_u32(payload_len as u32);
    msg.encode(&mut framed).expect("BytesMut grows on demand");
    framed.freeze()
}

/// Incremental splitter for length-prefixed gRPC frames on a request body.
#[derive(Default)]
struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        self.buf.extend_from_slice(&chunk);
        let mut messages = Vec::new();
        loop {
            if self.buf.len() < 5 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if self.buf.len() < 5 + len {
                break;
            }
            let frame = self.buf.split_to(5 + len).freeze();
            messages.push(frame.slice(5..));
        }
        messages
    }
}

/// A gRPC body carrying one message plus trailers.
struct UnaryBody {
    data: Option<Bytes>,
    trailers_sent: bool,
}

impl http_body::Body for UnaryBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return std::task::Poll::Ready(Some(Ok(http_body::Frame::data(data))));
        }
        if !this.trailers_sent {
            this.trailers_sent = true;
            return std::task::Poll::Ready(Some(Ok(http_body::Frame::trailers(ok_trailers()))));
        }
        std::task::Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers_sent
    }
}

/// A gRPC body streaming watch responses out of a channel until the
/// producer side hangs up, then trailers.
struct StreamingBody {
    rx: mpsc::Receiver<proto::WatchResponse>,
    trailers_sent: bool,
}

impl http_body::Body for StreamingBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.trailers_sent {
            return std::task::Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(msg)) => std::task::Poll::Ready(Some(Ok(
                http_body::Frame::data(encode_grpc_message(&msg)),
            ))),
            std::task::Poll::Ready(None) => {
                this.trailers_sent = true;
                std::task::Poll::Ready(Some(Ok(http_body::Frame::trailers(ok_trailers()))))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

fn ok_trailers() -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", "0".parse().expect("static header value"));
    trailers
}

type HttpResponse = tonic::codegen::http::Response<tonic::body::BoxBody>;

/// Build a gRPC response with proper headers and trailers.
fn grpc_response(body: Bytes) -> HttpResponse {
    let body = tonic::body::BoxBody::new(UnaryBody {
        data: Some(body),
        trailers_sent: false,
    });

    tonic::codegen::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(body)
        .expect("static response parts")
}

fn grpc_streaming_response(rx: mpsc::Receiver<proto::WatchResponse>) -> HttpResponse {
    let body = tonic::body::BoxBody::new(StreamingBody {
        rx,
        trailers_sent: false,
    });

    tonic::codegen::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(body)
        .expect("static response parts")
}

/// Build a gRPC error response.
fn grpc_error_response(status: Status) -> HttpResponse {
    status.into_http()
}

/// Collect a unary request body until one complete message is buffered.
async fn collect_unary_body<B>(body: B) -> Result<Bytes, Status>
where
    B: tonic::codegen::Body + Send,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send,
{
    let mut data = BytesMut::new();
    let mut pinned = std::pin::pin!(body);

    loop {
        match pinned.as_mut().frame().await {
            Some(Ok(frame)) => {
                if frame.is_data() {
                    if let Ok(chunk) = frame.into_data() {
                        let chunk: Bytes = chunk.into();
                        data.extend_from_slice(&chunk);
                        if data.len() >= 5 {
                            let len =
                                u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
                            if data.len() >= 5 + len {
                                break;
                            }
                        }
                    }
                } else if frame.is_trailers() {
                    break;
                }
            }
            Some(Err(_)) => {
                return Err(Status::internal("failed to read request body"));
            }
            None => break,
        }
    }

    Ok(data.freeze())
}

// ============================================================================
// Service implementations
// ============================================================================

/// etcdserverpb.KV: Range, Txn, Compact.
#[derive(Clone)]
pub struct KvServer {
    proxy: Arc<ProxyServer>,
}

impl KvServer {
    pub fn new(proxy: Arc<ProxyServer>) -> Self {
        Self { proxy }
    }
}

impl tonic::server::NamedService for KvServer {
    const NAME: &'static str = "etcdserverpb.KV";
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for KvServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let collected = match collect_unary_body(req.into_body()).await {
                Ok(collected) => collected,
                Err(status) => return Ok(grpc_error_response(status)),
            };

            let response = match path.as_str() {
                "/etcdserverpb.KV/Range" => {
                    match decode_grpc_message::<proto::RangeRequest>(&collected) {
                        Ok(req) => match proxy.range(req).await {
                            Ok(resp) => grpc_response(encode_grpc_message(&resp)),
                            Err(err) => grpc_error_response(error::to_status(err)),
                        },
                        Err(status) => grpc_error_response(status),
                    }
                }
                "/etcdserverpb.KV/Txn" => {
                    match decode_grpc_message::<proto::TxnRequest>(&collected) {
                        Ok(req) => match proxy.txn(req).await {
                            Ok(resp) => grpc_response(encode_grpc_message(&resp)),
                            Err(err) => grpc_error_response(error::to_status(err)),
                        },
                        Err(status) => grpc_error_response(status),
                    }
                }
                "/etcdserverpb.KV/Compact" => {
                    match decode_grpc_message::<proto::CompactionRequest>(&collected) {
                        Ok(req) => match proxy.compact(req).await {
                            Ok(resp) => grpc_response(encode_grpc_message(&resp)),
                            Err(err) => grpc_error_response(error::to_status(err)),
                        },
                        Err(status) => grpc_error_response(status),
                    }
                }
                _ => grpc_error_response(Status::unimplemented(format!(
                    "unknown KV method: {}",
                    path
                ))),
            };

            Ok(response)
        })
    }
}

/// etcdserverpb.Watch: the bidirectional Watch stream.
#[derive(Clone)]
pub struct WatchServer {
    proxy: Arc<ProxyServer>,
}

impl WatchServer {
    pub fn new(proxy: Arc<ProxyServer>) -> Self {
        Self { proxy }
    }
}

impl tonic::server::NamedService for WatchServer {
    const NAME: &'static str = "etcdserverpb.Watch";
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for WatchServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            if path != "/etcdserverpb.Watch/Watch" {
                return Ok(grpc_error_response(Status::unimplemented(format!(
                    "unknown Watch method: {}",
                    path
                ))));
            }

            let (req_tx, req_rx) = mpsc::channel::<Result<proto::WatchRequest, ProxyError>>(16);
            let (resp_tx, resp_rx) = mpsc::channel::<proto::WatchResponse>(16);

            // Request-side pump: split body frames into watch requests.
            let body = req.into_body();
            tokio::spawn(async move {
                let mut pinned = std::pin::pin!(body);
                let mut frames = FrameBuffer::default();
                loop {
                    match pinned.as_mut().frame().await {
                        Some(Ok(frame)) => {
                            if frame.is_data() {
                                if let Ok(chunk) = frame.into_data() {
                                    for msg in frames.push(chunk.into()) {
                                        let parsed = proto::WatchRequest::decode(&msg[..])
                                            .map_err(|e| ProxyError::InvalidRequest {
                                                message: format!("bad watch request: {}", e),
                                            });
                                        if req_tx.send(parsed).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            } else if frame.is_trailers() {
                                return;
                            }
                        }
                        Some(Err(_)) | None => return,
                    }
                }
            });

            // Session task: the translation layer owns the connection.
            tokio::spawn(async move {
                let _ = proxy.watch(ReceiverStream::new(req_rx), resp_tx).await;
            });

            Ok(grpc_streaming_response(resp_rx))
        })
    }
}

/// etcdserverpb.Lease: LeaseGrant.
#[derive(Clone)]
pub struct LeaseServer {
    proxy: Arc<ProxyServer>,
}

impl LeaseServer {
    pub fn new(proxy: Arc<ProxyServer>) -> Self {
        Self { proxy }
    }
}

impl tonic::server::NamedService for LeaseServer {
    const NAME: &'static str = "etcdserverpb.Lease";
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for LeaseServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let collected = match collect_unary_body(req.into_body()).await {
                Ok(collected) => collected,
                Err(status) => return Ok(grpc_error_response(status)),
            };

            let response = match path.as_str() {
                "/etcdserverpb.Lease/LeaseGrant" => {
                    match decode_grpc_message::<proto::LeaseGrantRequest>(&collected) {
                        Ok(req) => match proxy.lease_grant(req).await {
                            Ok(resp) => grpc_response(encode_grpc_message(&resp)),
                            Err(err) => grpc_error_response(error::to_status(err)),
                        },
                        Err(status) => grpc_error_response(status),
                    }
                }
                _ => grpc_error_response(Status::unimplemented(format!(
                    "unknown Lease method: {}",
                    path
                ))),
            };

            Ok(response)
        })
    }
}

// ============================================================================
// Server construction
// ============================================================================

/// Build the tonic server with mutual TLS and keepalive from the listener
/// configuration. Client certificates are required and verified whenever
/// TLS material is configured.
pub fn build_server(cfg: &ListenerConfig) -> Result<Server> {
    let mut builder = Server::builder()
        .tcp_keepalive(Some(cfg.max_idle()))
        .http2_keepalive_interval(Some(cfg.keepalive_interval()))
        .http2_keepalive_timeout(Some(cfg.keepalive_timeout()));

    if cfg.tls_enabled() {
        let cert = std::fs::read(cfg.cert_file.as_deref().unwrap_or_default())
            .context("reading cert-file")?;
        let key = std::fs::read(cfg.key_file.as_deref().unwrap_or_default())
            .context("reading key-file")?;
        let ca = std::fs::read(cfg.ca_file.as_deref().unwrap_or_default())
            .context("reading ca-file")?;

        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca))
            .client_auth_optional(false);
        builder = builder.tls_config(tls).context("configuring TLS")?;
    }

    Ok(builder)
}

/// Serve the proxy until `shutdown` resolves.
pub async fn serve(
    proxy: Arc<ProxyServer>,
    cfg: &ListenerConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let addr: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("invalid listener bind address {}", cfg.bind))?;

    let mut server = build_server(cfg)?;
    let router = server
        .add_service(KvServer::new(proxy.clone()))
        .add_service(WatchServer::new(proxy.clone()))
        .add_service(LeaseServer::new(proxy));

    tracing::info!(%addr, "starting proxy gRPC server");
    router
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("gRPC server error")?;
    Ok(())
}
