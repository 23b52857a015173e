//! Locally known list of discoverable sessions

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::metadata::SessionMetadata;
use crate::transport::{DirectoryBackend, SessionHandle, TransportAdapter};

/// Sessions seen in the most recent directory listing
#[derive(Debug, Default)]
pub struct SessionBrowser {
    entries: BTreeMap<SessionHandle, SessionMetadata>,
}

impl SessionBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&SessionMetadata> {
        self.entries.get(&handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = (SessionHandle, &SessionMetadata)> {
        self.entries.iter().map(|(&handle, metadata)| (handle, metadata))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record `metadata` for `handle` if it looks like a live session.
    ///
    /// Sessions without members or without a host name are leftovers of the
    /// directory and are dropped.
    pub fn offer(&mut self, handle: SessionHandle, metadata: SessionMetadata) -> bool {
        if metadata.used_slots == 0 || metadata.host_display_name.is_empty() {
            debug!("Skipping stale session {}", handle);
            self.entries.remove(&handle);
            return false;
        }
        self.entries.insert(handle, metadata);
        true
    }

    /// Rebuild the list from a listing result. `current` (the session we
    /// are in, if any) is never listed. Returns the number of entries kept.
    pub fn reconcile<B: DirectoryBackend>(
        &mut self,
        transport: &TransportAdapter<B>,
        current: SessionHandle,
        handles: &[SessionHandle],
    ) -> usize {
        info!("Found {} total sessions", handles.len());
        self.entries.clear();

        for &handle in handles {
            if handle == current {
                continue;
            }
            if let Some(metadata) = fetch(transport, handle) {
                info!(
                    "{} has {} users in it and is currently {:?}",
                    metadata.host_display_name, metadata.used_slots, metadata.status
                );
                self.offer(handle, metadata);
            }
        }
        self.entries.len()
    }

    /// Re-read a listed session after its metadata changed.
    /// Returns false when the handle is not listed or the entry was dropped.
    pub fn refresh_entry<B: DirectoryBackend>(
        &mut self,
        transport: &TransportAdapter<B>,
        handle: SessionHandle,
    ) -> bool {
        if !self.entries.contains_key(&handle) {
            return false;
        }
        match fetch(transport, handle) {
            Some(metadata) => self.offer(handle, metadata),
            None => {
                self.entries.remove(&handle);
                false
            }
        }
    }
}

/// Fetch and decode one session's metadata, with the live member count
fn fetch<B: DirectoryBackend>(
    transport: &TransportAdapter<B>,
    handle: SessionHandle,
) -> Option<SessionMetadata> {
    let blob = match transport.get_session_metadata(handle) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("Failed to read metadata of session {}: {}", handle, e);
            return None;
        }
    };

    let mut metadata = match SessionMetadata::parse(&blob) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("Ignoring session {} with malformed metadata: {}", handle, e);
            return None;
        }
    };

    metadata.session_id = handle;
    match transport.enumerate_peers(handle) {
        Ok(members) => metadata.used_slots = members.len(),
        Err(e) => warn!("Failed to count members of session {}: {}", handle, e),
    }
    Some(metadata)
}
