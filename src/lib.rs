//! Trellis - federation proxy for etcd-style key-value clusters.
//!
//! Trellis presents several independent, strongly-consistent MVCC clusters
//! (*members*) as one virtual cluster speaking the etcd v3 wire protocol.
//! Keys are sharded across members by prefix, yet clients observe a single
//! monotonically increasing global revision: the *meta-revision*, kept on
//! a dedicated *coordinator* cluster and stamped into every stored value.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      etcd v3 clients                            │
//! │           Range │ Txn │ Watch │ LeaseGrant │ Compact            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Translation layer                            │
//! │     meta-rev acquisition │ member selection │ rev rewriting     │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │                              │
//! ┌────────────────────────────┐   ┌─────────────────────────────────┐
//! │        Meta clock          │   │          Member pool            │
//! │  now │ tick │ reconstitute │   │  key directory │ watch mux      │
//! └────────────────────────────┘   └─────────────────────────────────┘
//!                  │                              │
//! ┌────────────────────────────┐   ┌─────────────────────────────────┐
//! │    Coordinator cluster     │   │        Member clusters          │
//! │  clock key │ recovery lock │   │  sharded data │ clock mirrors   │
//! └────────────────────────────┘   └─────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::error`] - Error types and gRPC status mapping
//!
//! ## Protocol
//! - [`proto`] - etcd v3 wire types (in-crate, no codegen)
//! - [`scheme`] - meta-rev suffix codec and txn validation
//!
//! ## Federation
//! - [`membership`] - member capabilities, pool, coordinator client
//! - [`clock`] - the meta-clock: now, tick, loss recovery
//! - [`resolver`] - meta-rev to member-rev translation
//! - [`watchmux`] - meta-rev-ordered watch multiplexing
//!
//! ## Serving
//! - [`proxy`] - translation layer and the client-facing gRPC surface
//! - [`ops::observability`] - request, resolver-depth and watch metrics
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - **Suffix**: every stored value ends with an 8-byte little-endian
//!   meta-rev written atomically with the put; reads strip it and report
//!   it as the modification revision
//! - **Clock monotonicity**: the meta-clock never decreases and advances
//!   by exactly one per successful write transaction
//! - **Clock mirroring**: both branches of every write transaction put the
//!   new meta-rev onto the member's clock key
//! - **Single owner**: each key belongs to exactly one member; txns never
//!   cross members
//! - **Recovery**: a lost clock is rebuilt as `max(member clocks) + δ` and
//!   stored as that value minus one, so the next tick resumes without
//!   duplicating a revision

// Core infrastructure
pub mod core;

// Wire protocol and encoding scheme
pub mod proto;
pub mod scheme;

// Federation machinery
pub mod clock;
pub mod membership;
pub mod resolver;
pub mod watchmux;

// Serving
pub mod ops;
pub mod proxy;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use clock::MetaClock;
pub use membership::{ClientSet, CoordinatorClient, KvApi, LeaseApi, Pool, WatchApi, WatchMux};
pub use proxy::ProxyServer;
pub use resolver::RevisionResolver;
pub use watchmux::{MemberFeed, WatchHub};
