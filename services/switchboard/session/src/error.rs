//! Session error types.

use crate::session::SessionId;
use switchboard_storage::StorageError;
use switchboard_wire::WireError;
use thiserror::Error;

/// Transport write/close errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport was closed
    #[error("transport closed")]
    Closed,
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Authorizer rejected the handshake
    #[error("handshake not authorized")]
    Unauthorized,

    /// Authorization did not finish before the first-data deadline
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No session with this id
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Session is closed
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// Namespace is not registered, or not joined by the session
    #[error("unknown namespace {0:?}")]
    UnknownNamespace(String),

    /// Upgrade request that cannot be honored
    #[error("upgrade rejected: {0}")]
    Upgrade(&'static str),

    /// Handshake request could not be parsed
    #[error("bad handshake: {0}")]
    BadRequest(String),

    /// Structural decode error
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Storage collaborator failure
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}
