//! Error types and gRPC status mapping.
//!
//! Trellis defines the error conditions the proxy can surface and maps them
//! to gRPC status codes at the wire boundary. Only a lost meta-clock is
//! recovered locally (see `clock`); everything else propagates to the
//! caller.

use thiserror::Error;
use tonic::Status;

/// Proxy error conditions.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transaction references keys owned by more than one member.
    #[error("transaction spans multiple members")]
    CrossShardTxn,

    /// Watch start revision precedes the multiplexer's retention window.
    #[error("watch starting revision {start_rev} is too old")]
    StartRevisionTooOld { start_rev: i64 },

    /// The store reported a missing key where one was required.
    ///
    /// On the coordinator's clock key this is the clock-lost trigger.
    #[error("key not found")]
    KeyNotFound,

    /// Requested revision has been compacted away.
    #[error("revision {revision} has been compacted")]
    RevisionCompacted { revision: i64 },

    /// A member (or the coordinator) could not be reached or failed an RPC.
    #[error("member {member} unavailable: {message}")]
    MemberUnavailable { member: String, message: String },

    /// A member rejected a lease grant.
    #[error("lease grant failed on member {member}: {message}")]
    LeaseFailed { member: String, message: String },

    /// Malformed or unroutable request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Wrap a transport-level failure against a named peer.
    pub fn unavailable(member: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::MemberUnavailable {
            member: member.into(),
            message: err.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type using ProxyError.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Map a ProxyError to a tonic Status for the wire.
pub fn to_status(err: ProxyError) -> Status {
    match err {
        ProxyError::CrossShardTxn => Status::invalid_argument(err.to_string()),
        ProxyError::StartRevisionTooOld { .. } => Status::out_of_range(err.to_string()),
        ProxyError::KeyNotFound => Status::not_found(err.to_string()),
        ProxyError::RevisionCompacted { .. } => Status::out_of_range(err.to_string()),
        ProxyError::MemberUnavailable { .. } => Status::unavailable(err.to_string()),
        ProxyError::LeaseFailed { .. } => Status::unavailable(err.to_string()),
        ProxyError::InvalidRequest { message } => Status::invalid_argument(message),
        ProxyError::Internal { message } => Status::internal(message),
    }
}

/// Map an upstream Status from a member back into a ProxyError.
///
/// NotFound is preserved so the clock service can distinguish a lost clock
/// from a dead coordinator.
pub fn from_status(member: &str, status: Status) -> ProxyError {
    match status.code() {
        tonic::Code::NotFound => ProxyError::KeyNotFound,
        tonic::Code::OutOfRange => ProxyError::RevisionCompacted { revision: 0 },
        _ => ProxyError::unavailable(member, status),
    }
}
