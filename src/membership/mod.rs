//! Member and coordinator clients.
//!
//! A member is reached through a set of capability objects (KV, Watch,
//! Lease) so the proxy core never depends on a concrete transport. The
//! pool is the read-only directory from keys to owning members plus the
//! parallel fan-out primitive; the coordinator client adds the
//! clock-reconstitution mutex.

pub mod client;
pub mod coordinator;
pub mod grpc;
pub mod pool;

pub use client::{ClientSet, KvApi, LeaseApi, WatchApi};
pub use coordinator::{CoordinatorClient, KvMutex, MutexGuard};
pub use grpc::GrpcMember;
pub use pool::{KeySelector, Member, Pool, WatchMux};
