//! Per-peer ancillary info sent over the reliable message channel

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{DirectoryBackend, SessionHandle, TransportAdapter, TransportError};

/// Ancillary state of one peer, sent point-to-point as UTF-8 JSON
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// The peer is fetching the selected item
    #[serde(default)]
    pub downloading: bool,
    /// The peer has the item and is ready to start
    #[serde(default)]
    pub ready: bool,
}

impl PlayerInfo {
    pub fn encode(&self) -> Vec<u8> {
        // Serializing two bools cannot fail
        serde_json::to_string(self).unwrap_or_default().into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Holds the local peer's [`PlayerInfo`] and fans it out on change.
///
/// Delivery goes to the peers enumerated at send time only. Peers that join
/// later pick up the next change.
#[derive(Debug, Default)]
pub struct PlayerInfoChannel {
    local: PlayerInfo,
}

impl PlayerInfoChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> PlayerInfo {
        self.local
    }

    /// Apply `change` to the local info and broadcast if anything changed.
    /// Returns the number of peers the update was sent to.
    pub fn update<B: DirectoryBackend>(
        &mut self,
        transport: &TransportAdapter<B>,
        session: SessionHandle,
        change: impl FnOnce(&mut PlayerInfo),
    ) -> Result<usize, TransportError> {
        let before = self.local;
        change(&mut self.local);
        if self.local == before {
            return Ok(0);
        }
        self.broadcast(transport, session)
    }

    /// Send the local info to every other member of `session`
    pub fn broadcast<B: DirectoryBackend>(
        &self,
        transport: &TransportAdapter<B>,
        session: SessionHandle,
    ) -> Result<usize, TransportError> {
        if session.is_none() {
            return Ok(0);
        }

        let me = transport.local_peer();
        let payload = self.local.encode();
        let mut sent = 0;
        for peer in transport.enumerate_peers(session)? {
            if peer == me {
                continue;
            }
            match transport.send_reliable(peer, &payload) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to send player info to {}: {}", peer, e),
            }
        }
        debug!("Player info {:?} sent to {} peers", self.local, sent);
        Ok(sent)
    }

    /// Forget the local info without broadcasting
    pub fn reset(&mut self) {
        self.local = PlayerInfo::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryDirectory, TransportEvent, Visibility};

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let info = PlayerInfo::decode(br#"{"downloading":true,"avatar":"x"}"#).unwrap();
        assert!(info.downloading);
        assert!(!info.ready);
        assert!(PlayerInfo::decode(b"not json").is_err());
    }

    #[test]
    fn test_update_fans_out_to_other_members_only() {
        let directory = MemoryDirectory::new();
        let (host, mut host_rx) = directory.connect("host");
        let (guest, mut guest_rx) = directory.connect("guest");
        let host = TransportAdapter::new(host);
        let guest = TransportAdapter::new(guest);

        host.create_session(Visibility::Public, 5).unwrap();
        let handle = match host_rx.try_recv().unwrap() {
            TransportEvent::SessionCreated { result } => result.unwrap(),
            other => panic!("unexpected event {:?}", other),
        };
        guest.join_session(handle).unwrap();
        while guest_rx.try_recv().is_ok() {}
        while host_rx.try_recv().is_ok() {}

        let mut channel = PlayerInfoChannel::new();
        let sent = channel
            .update(&host, handle, |info| info.downloading = true)
            .unwrap();
        assert_eq!(sent, 1);
        assert!(host_rx.try_recv().is_err());
        match guest_rx.try_recv().unwrap() {
            TransportEvent::PeerMessage { from, payload } => {
                assert_eq!(from, host.local_peer());
                assert!(PlayerInfo::decode(&payload).unwrap().downloading);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Unchanged info is not resent
        let sent = channel
            .update(&host, handle, |info| info.downloading = true)
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_no_session_sends_nothing() {
        let directory = MemoryDirectory::new();
        let (backend, _rx) = directory.connect("solo");
        let transport = TransportAdapter::new(backend);
        let mut channel = PlayerInfoChannel::new();
        let sent = channel
            .update(&transport, SessionHandle::NONE, |info| info.ready = true)
            .unwrap();
        assert_eq!(sent, 0);
        assert!(channel.local().ready);
    }
}
