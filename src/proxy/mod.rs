//! The proxy: request translation and the client-facing gRPC surface.

pub mod grpc;
pub mod server;

pub use server::ProxyServer;
