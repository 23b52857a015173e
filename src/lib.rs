//! lobbylink - Host-authoritative lobby synchronization for small peer groups
//!
//! One peer hosts a session in an external directory service and owns its
//! shared metadata; every other member follows. The crate keeps each peer's
//! copy of the metadata converged, tracks per-peer readiness, and drives the
//! lobby from item selection through a shared activity and back.

pub mod bootstrap;
pub mod config;
pub mod content;
pub mod lobby;
pub mod transport;

pub use config::{Settings, SettingsStore};
pub use lobby::{
    ConnectionState, LobbyError, LobbyHandle, LobbyNotice, LobbyService, Phase, SessionController,
    SessionMetadata,
};
pub use transport::{MemoryDirectory, SessionHandle, TransportAdapter};
