//! The external directory/messaging capability
//!
//! A `DirectoryBackend` is whatever service lists sessions, tracks
//! membership, stores small per-session key/value data and carries reliable
//! point-to-point messages. Requests that complete later (create, join,
//! list) return immediately and report through the backend's
//! [`TransportEvent`](super::TransportEvent) channel.

use super::error::TransportError;
use super::types::{PeerId, SessionFilter, SessionHandle, Visibility};

/// Raw directory capability. Implementations do not need to check
/// availability themselves; [`TransportAdapter`](super::TransportAdapter)
/// does that before every call.
pub trait DirectoryBackend: Send + Sync {
    /// Whether the capability is currently usable
    fn is_available(&self) -> bool;

    /// Identity of the local peer
    fn local_peer(&self) -> PeerId;

    /// Human-readable name for a peer
    fn display_name(&self, peer: PeerId) -> Result<String, TransportError>;

    /// Request a new session; completes with `SessionCreated`
    fn create_session(&self, visibility: Visibility, max_members: usize) -> Result<(), TransportError>;

    /// Request to enter `handle`; completes with `SessionEntered`
    fn join_session(&self, handle: SessionHandle) -> Result<(), TransportError>;

    fn leave_session(&self, handle: SessionHandle) -> Result<(), TransportError>;

    /// Read a metadata value. `None` when the key was never set.
    fn session_data(&self, handle: SessionHandle, key: &str) -> Result<Option<String>, TransportError>;

    /// Write a metadata value. Silently ignored unless the caller owns the session.
    fn set_session_data(&self, handle: SessionHandle, key: &str, value: &str) -> Result<(), TransportError>;

    fn session_owner(&self, handle: SessionHandle) -> Result<PeerId, TransportError>;

    /// Current members of `handle`, in directory order
    fn members(&self, handle: SessionHandle) -> Result<Vec<PeerId>, TransportError>;

    fn set_member_limit(&self, handle: SessionHandle, limit: usize) -> Result<(), TransportError>;

    fn set_joinable(&self, handle: SessionHandle, joinable: bool) -> Result<(), TransportError>;

    /// Request a session listing; completes with `ListReceived`
    fn request_session_list(&self, filter: SessionFilter) -> Result<(), TransportError>;

    fn send_reliable(&self, peer: PeerId, payload: &[u8]) -> Result<(), TransportError>;
}
