//! Identifiers and events shared between the directory backend and the lobby core

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::TransportError;

/// Key under which the session metadata blob is stored in the directory
pub const METADATA_KEY: &str = "LOBBY_INFO";

/// Opaque session handle assigned by the directory. `0` means "no session".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    /// The "no session" handle
    pub const NONE: SessionHandle = SessionHandle(0);

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory-assigned peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Who can discover a newly created session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    FriendsOnly,
    Private,
}

/// Filter applied by the directory when listing sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFilter {
    /// Minimum number of open slots a listed session must have
    pub min_open_slots: usize,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self { min_open_slots: 1 }
    }
}

/// Completions and notifications delivered by the directory capability.
///
/// Events may arrive for sessions the lobby core no longer cares about;
/// consumers must check them against their current state.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A `create_session` request completed
    SessionCreated {
        result: Result<SessionHandle, TransportError>,
    },
    /// A `join_session` request for `handle` completed
    SessionEntered {
        handle: SessionHandle,
        result: Result<(), TransportError>,
    },
    /// A `list_sessions` request completed
    ListReceived { handles: Vec<SessionHandle> },
    /// The metadata of `handle` changed
    MetadataChanged { handle: SessionHandle },
    /// A peer entered `handle`
    PeerJoined { handle: SessionHandle, peer: PeerId },
    /// A peer left `handle`
    PeerLeft { handle: SessionHandle, peer: PeerId },
    /// A reliable point-to-point message arrived
    PeerMessage { from: PeerId, payload: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_handle() {
        assert!(SessionHandle::NONE.is_none());
        assert!(SessionHandle::default().is_none());
        assert!(!SessionHandle(42).is_none());
        assert_eq!(SessionHandle(42).raw(), 42);
    }

    #[test]
    fn test_default_filter_requires_open_slot() {
        assert_eq!(SessionFilter::default().min_open_slots, 1);
    }
}
