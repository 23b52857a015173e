//! Transport error types

use thiserror::Error;

use super::types::{PeerId, SessionHandle};

/// Errors reported by the directory capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: directory capability is not ready")]
    NotReady,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionHandle),

    #[error("Session is full")]
    SessionFull,

    #[error("Session is not joinable")]
    NotJoinable,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Backend error: {0}")]
    Backend(String),
}
