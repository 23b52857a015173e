//! Lobby error types

use thiserror::Error;

use super::metadata::Phase;
use crate::transport::TransportError;

/// Reasons a metadata blob could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Empty metadata blob")]
    Empty,

    #[error("Unsupported metadata version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid value for {field}: {value:?}")]
    BadField { field: &'static str, value: String },

    #[error("Invalid escape sequence in metadata blob")]
    BadEscape,

    #[error("Slot counts out of range: total={total}, max={max}")]
    SlotRange { total: usize, max: usize },
}

/// Errors surfaced by the session controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LobbyError {
    #[error("Connection failed: directory capability is not ready")]
    ConnectionFailed,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidPhase { from: Phase, to: Phase },

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Lobby service stopped")]
    ServiceStopped,
}

impl From<TransportError> for LobbyError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotReady => LobbyError::ConnectionFailed,
            other => LobbyError::Transport(other),
        }
    }
}
