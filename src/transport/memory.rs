//! In-process directory backend
//!
//! A shared `MemoryDirectory` routes sessions, metadata and peer messages
//! between any number of `MemoryBackend` instances in the same process.
//! Used by the integration tests and the `demo` command; it also carries
//! fault switches for exercising failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::backend::DirectoryBackend;
use super::error::TransportError;
use super::types::{PeerId, SessionFilter, SessionHandle, TransportEvent, Visibility};

/// A session as the directory sees it
struct HostedSession {
    owner: PeerId,
    members: Vec<PeerId>,
    data: HashMap<String, String>,
    member_limit: usize,
    joinable: bool,
    visibility: Visibility,
}

struct PeerSlot {
    name: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct DirectoryState {
    available: bool,
    fail_leaves: bool,
    rejected_joins: HashSet<SessionHandle>,
    next_peer: u64,
    peers: HashMap<PeerId, PeerSlot>,
    sessions: BTreeMap<SessionHandle, HostedSession>,
}

impl DirectoryState {
    fn notify(&self, peer: PeerId, event: TransportEvent) {
        if let Some(slot) = self.peers.get(&peer) {
            // A dropped receiver just means the peer went away
            let _ = slot.events.send(event);
        }
    }

    fn session(&self, handle: SessionHandle) -> Result<&HostedSession, TransportError> {
        self.sessions
            .get(&handle)
            .ok_or(TransportError::SessionNotFound(handle))
    }

    fn allocate_handle(&self) -> SessionHandle {
        loop {
            let raw = rand::random::<u64>() >> 1;
            let handle = SessionHandle(raw);
            if !handle.is_none() && !self.sessions.contains_key(&handle) {
                return handle;
            }
        }
    }
}

/// Shared in-process directory
#[derive(Clone)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DirectoryState {
                available: true,
                fail_leaves: false,
                rejected_joins: HashSet::new(),
                next_peer: 1,
                peers: HashMap::new(),
                sessions: BTreeMap::new(),
            })),
        }
    }

    /// Register a peer and return its backend plus event stream
    pub fn connect(&self, name: &str) -> (MemoryBackend, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let peer = PeerId(state.next_peer);
        state.next_peer += 1;
        state.peers.insert(
            peer,
            PeerSlot {
                name: name.to_string(),
                events: tx,
            },
        );
        debug!("{} registered with the in-memory directory as {}", name, peer);

        (
            MemoryBackend {
                peer,
                directory: self.clone(),
            },
            rx,
        )
    }

    /// Simulate the capability going up or down
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make every `leave_session` call fail
    pub fn set_fail_leaves(&self, fail: bool) {
        self.state.lock().fail_leaves = fail;
    }

    /// Make joins of `handle` complete with an error
    pub fn reject_joins(&self, handle: SessionHandle) {
        self.state.lock().rejected_joins.insert(handle);
    }

    pub fn is_member(&self, handle: SessionHandle, peer: PeerId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&handle)
            .map(|s| s.members.contains(&peer))
            .unwrap_or(false)
    }

    pub fn session_exists(&self, handle: SessionHandle) -> bool {
        self.state.lock().sessions.contains_key(&handle)
    }

    pub fn member_limit(&self, handle: SessionHandle) -> Option<usize> {
        self.state.lock().sessions.get(&handle).map(|s| s.member_limit)
    }

    pub fn is_joinable(&self, handle: SessionHandle) -> Option<bool> {
        self.state.lock().sessions.get(&handle).map(|s| s.joinable)
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's view of a [`MemoryDirectory`]
pub struct MemoryBackend {
    peer: PeerId,
    directory: MemoryDirectory,
}

impl DirectoryBackend for MemoryBackend {
    fn is_available(&self) -> bool {
        self.directory.state.lock().available
    }

    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn display_name(&self, peer: PeerId) -> Result<String, TransportError> {
        self.directory
            .state
            .lock()
            .peers
            .get(&peer)
            .map(|slot| slot.name.clone())
            .ok_or(TransportError::UnknownPeer(peer))
    }

    fn create_session(&self, visibility: Visibility, max_members: usize) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        let handle = state.allocate_handle();
        state.sessions.insert(
            handle,
            HostedSession {
                owner: self.peer,
                members: vec![self.peer],
                data: HashMap::new(),
                member_limit: max_members,
                joinable: true,
                visibility,
            },
        );
        info!("Session {} created by {}", handle, self.peer);
        state.notify(
            self.peer,
            TransportEvent::SessionCreated { result: Ok(handle) },
        );
        Ok(())
    }

    fn join_session(&self, handle: SessionHandle) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        let rejected = state.rejected_joins.contains(&handle);

        let result = match state.sessions.get_mut(&handle) {
            None => Err(TransportError::SessionNotFound(handle)),
            Some(_) if rejected => Err(TransportError::Backend("join rejected".to_string())),
            Some(session) if session.members.contains(&self.peer) => Ok(Vec::new()),
            Some(session) if !session.joinable => Err(TransportError::NotJoinable),
            Some(session) if session.members.len() >= session.member_limit => {
                Err(TransportError::SessionFull)
            }
            Some(session) => {
                let others = session.members.clone();
                session.members.push(self.peer);
                Ok(others)
            }
        };

        match result {
            Ok(others) => {
                for other in others {
                    state.notify(
                        other,
                        TransportEvent::PeerJoined {
                            handle,
                            peer: self.peer,
                        },
                    );
                }
                state.notify(
                    self.peer,
                    TransportEvent::SessionEntered {
                        handle,
                        result: Ok(()),
                    },
                );
            }
            Err(e) => {
                state.notify(
                    self.peer,
                    TransportEvent::SessionEntered {
                        handle,
                        result: Err(e),
                    },
                );
            }
        }
        Ok(())
    }

    fn leave_session(&self, handle: SessionHandle) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        if state.fail_leaves {
            return Err(TransportError::Backend("leave failed".to_string()));
        }

        let Some(session) = state.sessions.get_mut(&handle) else {
            return Ok(());
        };
        let Some(pos) = session.members.iter().position(|&p| p == self.peer) else {
            return Ok(());
        };
        session.members.remove(pos);

        let remaining = session.members.clone();
        // No ownership migration: the session ends with its owner
        let closed = session.owner == self.peer || remaining.is_empty();
        if closed {
            state.sessions.remove(&handle);
            info!("Session {} closed", handle);
        }
        for other in remaining {
            state.notify(
                other,
                TransportEvent::PeerLeft {
                    handle,
                    peer: self.peer,
                },
            );
        }
        Ok(())
    }

    fn session_data(&self, handle: SessionHandle, key: &str) -> Result<Option<String>, TransportError> {
        let state = self.directory.state.lock();
        Ok(state.session(handle)?.data.get(key).cloned())
    }

    fn set_session_data(&self, handle: SessionHandle, key: &str, value: &str) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        let session = state
            .sessions
            .get_mut(&handle)
            .ok_or(TransportError::SessionNotFound(handle))?;
        if session.owner != self.peer {
            return Ok(());
        }
        session.data.insert(key.to_string(), value.to_string());

        let members = session.members.clone();
        for member in members {
            state.notify(member, TransportEvent::MetadataChanged { handle });
        }
        Ok(())
    }

    fn session_owner(&self, handle: SessionHandle) -> Result<PeerId, TransportError> {
        let state = self.directory.state.lock();
        Ok(state.session(handle)?.owner)
    }

    fn members(&self, handle: SessionHandle) -> Result<Vec<PeerId>, TransportError> {
        let state = self.directory.state.lock();
        Ok(state.session(handle)?.members.clone())
    }

    fn set_member_limit(&self, handle: SessionHandle, limit: usize) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        let session = state
            .sessions
            .get_mut(&handle)
            .ok_or(TransportError::SessionNotFound(handle))?;
        if session.owner == self.peer {
            session.member_limit = limit;
        }
        Ok(())
    }

    fn set_joinable(&self, handle: SessionHandle, joinable: bool) -> Result<(), TransportError> {
        let mut state = self.directory.state.lock();
        let session = state
            .sessions
            .get_mut(&handle)
            .ok_or(TransportError::SessionNotFound(handle))?;
        if session.owner == self.peer {
            session.joinable = joinable;
        }
        Ok(())
    }

    fn request_session_list(&self, filter: SessionFilter) -> Result<(), TransportError> {
        let state = self.directory.state.lock();
        let handles = state
            .sessions
            .iter()
            .filter(|(_, s)| s.visibility == Visibility::Public && s.joinable)
            .filter(|(_, s)| s.member_limit.saturating_sub(s.members.len()) >= filter.min_open_slots)
            .map(|(&handle, _)| handle)
            .collect();
        state.notify(self.peer, TransportEvent::ListReceived { handles });
        Ok(())
    }

    fn send_reliable(&self, peer: PeerId, payload: &[u8]) -> Result<(), TransportError> {
        let state = self.directory.state.lock();
        if !state.peers.contains_key(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        state.notify(
            peer,
            TransportEvent::PeerMessage {
                from: self.peer,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }
}
