//! Lobby module
//!
//! Shared session state, its wire encoding, and the host-authoritative
//! state machine that keeps every peer's copy converged.

mod controller;
mod directory;
mod error;
mod metadata;
mod player_info;
mod readiness;
mod runtime;

pub use controller::{
    ConnectionState, ControllerConfig, LobbyNotice, LobbyOp, PushOutcome, SessionController,
    STATUS_IN_MENU,
};
pub use directory::SessionBrowser;
pub use error::{LobbyError, MetadataError};
pub use metadata::{
    ActivityModifiers, FieldSpec, Phase, SessionMetadata, SpeedModifier, DEFAULT_MAX_SLOTS,
    FIELDS, METADATA_VERSION, MIN_SLOTS,
};
pub use player_info::{PlayerInfo, PlayerInfoChannel};
pub use readiness::PeerReadiness;
pub use runtime::{LobbyHandle, LobbyService, LobbySnapshot};
