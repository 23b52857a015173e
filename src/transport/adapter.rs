//! Availability-checked front for a directory backend

use std::sync::Arc;

use tracing::{error, trace};

use super::backend::DirectoryBackend;
use super::error::TransportError;
use super::types::{PeerId, SessionFilter, SessionHandle, Visibility, METADATA_KEY};

/// Answers "who owns this session" for host-only writes.
///
/// Ownership is asked fresh on every call and never cached.
pub trait AuthorityOracle: Send + Sync {
    fn local_peer(&self) -> PeerId;

    fn session_owner(&self, handle: SessionHandle) -> Result<PeerId, TransportError>;

    /// Whether the local peer currently owns `handle`
    fn is_authority(&self, handle: SessionHandle) -> Result<bool, TransportError> {
        Ok(self.session_owner(handle)? == self.local_peer())
    }
}

/// Thin adapter over a [`DirectoryBackend`].
///
/// Every call that needs the capability checks availability first and fails
/// with [`TransportError::NotReady`] instead of reaching the backend.
pub struct TransportAdapter<B> {
    backend: Arc<B>,
}

impl<B> Clone for TransportAdapter<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B: DirectoryBackend> TransportAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Access the wrapped backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Directory capability availability
    pub fn is_ready(&self) -> bool {
        self.backend.is_available()
    }

    fn ensure_ready(&self, op: &str) -> Result<(), TransportError> {
        if self.backend.is_available() {
            Ok(())
        } else {
            error!("CONNECTION FAILED: {} while directory is unavailable", op);
            Err(TransportError::NotReady)
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.backend.local_peer()
    }

    pub fn display_name(&self, peer: PeerId) -> Result<String, TransportError> {
        self.ensure_ready("display_name")?;
        self.backend.display_name(peer)
    }

    pub fn create_session(&self, visibility: Visibility, max_slots: usize) -> Result<(), TransportError> {
        self.ensure_ready("create_session")?;
        trace!("Requesting {:?} session with {} slots", visibility, max_slots);
        self.backend.create_session(visibility, max_slots)
    }

    pub fn join_session(&self, handle: SessionHandle) -> Result<(), TransportError> {
        self.ensure_ready("join_session")?;
        self.backend.join_session(handle)
    }

    pub fn leave_session(&self, handle: SessionHandle) -> Result<(), TransportError> {
        self.ensure_ready("leave_session")?;
        self.backend.leave_session(handle)
    }

    /// Write the metadata blob. A no-op on the directory side unless the
    /// local peer owns the session.
    pub fn set_session_metadata(&self, handle: SessionHandle, blob: &str) -> Result<(), TransportError> {
        self.ensure_ready("set_session_metadata")?;
        self.backend.set_session_data(handle, METADATA_KEY, blob)
    }

    /// Read the metadata blob; an unset blob reads as empty
    pub fn get_session_metadata(&self, handle: SessionHandle) -> Result<String, TransportError> {
        self.ensure_ready("get_session_metadata")?;
        Ok(self
            .backend
            .session_data(handle, METADATA_KEY)?
            .unwrap_or_default())
    }

    pub fn list_sessions(&self, filter: SessionFilter) -> Result<(), TransportError> {
        self.ensure_ready("list_sessions")?;
        self.backend.request_session_list(filter)
    }

    pub fn send_reliable(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_ready("send_reliable")?;
        trace!("Sending {} bytes to {}", bytes.len(), peer);
        self.backend.send_reliable(peer, bytes)
    }

    pub fn enumerate_peers(&self, handle: SessionHandle) -> Result<Vec<PeerId>, TransportError> {
        self.ensure_ready("enumerate_peers")?;
        self.backend.members(handle)
    }

    pub fn set_member_limit(&self, handle: SessionHandle, limit: usize) -> Result<(), TransportError> {
        self.ensure_ready("set_member_limit")?;
        self.backend.set_member_limit(handle, limit)
    }

    pub fn set_joinable(&self, handle: SessionHandle, joinable: bool) -> Result<(), TransportError> {
        self.ensure_ready("set_joinable")?;
        self.backend.set_joinable(handle, joinable)
    }
}

impl<B: DirectoryBackend> AuthorityOracle for TransportAdapter<B> {
    fn local_peer(&self) -> PeerId {
        self.backend.local_peer()
    }

    fn session_owner(&self, handle: SessionHandle) -> Result<PeerId, TransportError> {
        self.ensure_ready("session_owner")?;
        self.backend.session_owner(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryDirectory;

    #[test]
    fn test_unavailable_backend_fails_fast() {
        let directory = MemoryDirectory::new();
        let (backend, _events) = directory.connect("alice");
        let adapter = TransportAdapter::new(backend);

        directory.set_available(false);
        assert!(!adapter.is_ready());
        assert_eq!(
            adapter.create_session(Visibility::Public, 5),
            Err(TransportError::NotReady)
        );
        assert_eq!(
            adapter.get_session_metadata(SessionHandle(1)),
            Err(TransportError::NotReady)
        );
        assert_eq!(
            adapter.session_owner(SessionHandle(1)),
            Err(TransportError::NotReady)
        );
    }

    #[test]
    fn test_unset_metadata_reads_empty() {
        let directory = MemoryDirectory::new();
        let (backend, mut events) = directory.connect("alice");
        let adapter = TransportAdapter::new(backend);

        adapter.create_session(Visibility::Public, 5).unwrap();
        let handle = match events.try_recv().unwrap() {
            crate::transport::TransportEvent::SessionCreated { result } => result.unwrap(),
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(adapter.get_session_metadata(handle).unwrap(), "");
        assert!(adapter.is_authority(handle).unwrap());
    }
}
