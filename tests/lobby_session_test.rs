//! Lobby session tests
//!
//! Several peers share one in-process directory; each peer's controller is
//! driven by hand and the event queues are drained until nothing moves.

use lobbylink::lobby::{
    ActivityModifiers, ConnectionState, ControllerConfig, LobbyError, LobbyNotice, Phase,
    SessionController, STATUS_IN_MENU,
};
use lobbylink::transport::{
    MemoryBackend, MemoryDirectory, SessionHandle, TransportAdapter, TransportEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

struct Peer {
    controller: SessionController<MemoryBackend>,
    events: UnboundedReceiver<TransportEvent>,
}

impl Peer {
    fn new(directory: &MemoryDirectory, name: &str) -> Self {
        let (backend, events) = directory.connect(name);
        let controller =
            SessionController::new(TransportAdapter::new(backend), ControllerConfig::default());
        Self { controller, events }
    }

    fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event);
            handled += 1;
        }
        handled
    }
}

/// Deliver events until every queue is empty
fn settle(peers: &mut [&mut Peer]) {
    loop {
        let handled: usize = peers.iter_mut().map(|peer| peer.drain()).sum();
        if handled == 0 {
            break;
        }
    }
}

fn host_session(directory: &MemoryDirectory, name: &str) -> (Peer, SessionHandle) {
    let mut host = Peer::new(directory, name);
    host.controller.create_session().expect("Failed to create session");
    settle(&mut [&mut host]);
    let session = host.controller.session_id();
    assert!(!session.is_none(), "Session should be created");
    (host, session)
}

fn join(guest: &mut Peer, host: &mut Peer, session: SessionHandle) {
    guest
        .controller
        .join_session(session)
        .expect("Failed to request join");
    settle(&mut [&mut *host, &mut *guest]);
    assert_eq!(guest.controller.connection_state(), ConnectionState::Connected);
}

/// Test: Joining a session
/// Given a hosted session
/// When a guest joins
/// Then the guest sees the host's metadata and the host counts two members
#[test]
fn test_guest_joins_hosted_session() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");

    join(&mut guest, &mut host, session);

    assert_eq!(host.controller.metadata().used_slots, 2);
    assert_eq!(guest.controller.metadata(), host.controller.metadata());
    assert_eq!(guest.controller.metadata().host_display_name, "Alice");
    assert_eq!(guest.controller.metadata().status, STATUS_IN_MENU);
    assert!(host.controller.is_host());
    assert!(!guest.controller.is_host());
}

/// Test: Every host mutation is one push
/// When the host selects an item and then a difficulty
/// Then the guest is notified twice and ends with both values
#[test]
fn test_item_then_difficulty_pushes_twice() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);

    assert_ok!(host.controller.select_item("abc123", "Song A"));
    assert_ok!(host.controller.select_difficulty(3));

    let mut changes = 0;
    while let Ok(event) = guest.events.try_recv() {
        if matches!(event, TransportEvent::MetadataChanged { handle } if handle == session) {
            changes += 1;
        }
        guest.controller.handle_event(event);
    }
    assert_eq!(changes, 2);

    let metadata = guest.controller.metadata();
    assert_eq!(metadata.current_item_id, "abc123");
    assert_eq!(metadata.current_item_name, "Song A");
    assert_eq!(metadata.current_item_difficulty, 3);
}

/// Test: Guests cannot write shared state
/// When a guest calls host-only operations
/// Then nothing changes locally or in the directory
#[test]
fn test_guest_mutations_are_ignored() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);
    let before = guest.controller.metadata().clone();

    assert_ok!(guest.controller.select_item("zzz", "Nope"));
    assert_ok!(guest.controller.adjust_slot_count());
    assert_ok!(guest.controller.toggle_joinable());
    assert_ok!(guest.controller.request_start(ActivityModifiers::default()));
    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.metadata(), &before);
    assert_eq!(host.controller.metadata(), &before);
    assert_eq!(directory.is_joinable(session), Some(true));
}

/// Test: Switching sessions
/// Given a guest in session Y
/// When it joins session X and that join fails
/// Then it ends FAILED and is no longer a member of Y
#[test]
fn test_failed_switch_leaves_previous_session() {
    let directory = MemoryDirectory::new();
    let (mut host_y, session_y) = host_session(&directory, "Yara");
    let (mut host_x, session_x) = host_session(&directory, "Xavier");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host_y, session_y);
    let guest_peer = guest.controller.local_peer();

    directory.reject_joins(session_x);
    guest.controller.join_session(session_x).unwrap();
    settle(&mut [&mut host_y, &mut host_x, &mut guest]);

    assert_eq!(guest.controller.connection_state(), ConnectionState::Failed);
    assert!(!directory.is_member(session_y, guest_peer));
    assert!(!directory.is_member(session_x, guest_peer));
    assert_eq!(host_y.controller.metadata().used_slots, 1);
}

/// Test: Teardown survives a failing leave
/// When the directory refuses the leave
/// Then the controller still ends DISCONNECTED with no session
#[test]
fn test_disconnect_with_failing_leave() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");

    directory.set_fail_leaves(true);
    host.controller.disconnect();

    assert_eq!(host.controller.connection_state(), ConnectionState::Disconnected);
    assert!(host.controller.session_id().is_none());
    assert!(host.controller.readiness().is_empty());
    // The directory still holds the membership the leave could not remove
    assert!(directory.session_exists(session));
}

/// Test: Full round with two members
/// Given a host and a guest
/// When the host requests a start and both report ready
/// Then the activity begins, and finishing clears readiness on both sides
#[test]
fn test_ready_round_trip() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);
    let mut guest_notices = guest.controller.subscribe();

    host.controller.select_item("abc123", "Song A").unwrap();
    host.controller
        .request_start(ActivityModifiers::default())
        .unwrap();
    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.metadata().phase, Phase::AwaitingDownload);
    assert_eq!(guest.controller.metadata().status, "Loading Song A");
    let mut requested = None;
    while let Ok(notice) = guest_notices.try_recv() {
        if let LobbyNotice::ContentRequested { item_id } = notice {
            requested = Some(item_id);
        }
    }
    assert_eq!(requested.as_deref(), Some("abc123"));

    guest.controller.mark_ready().unwrap();
    settle(&mut [&mut host, &mut guest]);
    assert_eq!(host.controller.metadata().phase, Phase::AwaitingDownload);
    assert!(host.controller.readiness().is_ready(guest.controller.local_peer()));

    host.controller.mark_ready().unwrap();
    settle(&mut [&mut host, &mut guest]);
    assert_eq!(host.controller.metadata().phase, Phase::InActivity);
    assert_eq!(guest.controller.metadata().phase, Phase::InActivity);
    let statuses = host.controller.member_statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|(_, ready)| *ready));

    guest.controller.finish_activity().unwrap();
    host.controller.finish_activity().unwrap();
    settle(&mut [&mut host, &mut guest]);

    assert!(host.controller.readiness().is_empty());
    assert!(guest.controller.readiness().is_empty());
    assert_eq!(guest.controller.metadata().phase, Phase::Menu);
    assert_eq!(guest.controller.metadata().status, STATUS_IN_MENU);
}

/// Test: Host leaving ends the session for everyone
#[test]
fn test_host_teardown_disconnects_guest() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);

    host.controller.disconnect();
    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.connection_state(), ConnectionState::Disconnected);
    assert!(guest.controller.session_id().is_none());
    assert!(!directory.session_exists(session));
}

/// Test: A departing guest is forgotten
/// Given a ready guest
/// When it leaves
/// Then the host drops its readiness and the member count falls
#[test]
fn test_guest_leave_clears_readiness() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);
    let guest_peer = guest.controller.local_peer();

    guest.controller.mark_ready().unwrap();
    settle(&mut [&mut host, &mut guest]);
    assert!(host.controller.readiness().is_ready(guest_peer));

    guest.controller.disconnect();
    settle(&mut [&mut host, &mut guest]);

    assert!(!host.controller.readiness().is_ready(guest_peer));
    assert_eq!(host.controller.metadata().used_slots, 1);
    assert_eq!(host.controller.connection_state(), ConnectionState::Connected);
}

/// Test: Malformed metadata is not applied
/// When the session blob is replaced by garbage
/// Then the guest keeps its previous snapshot
#[test]
fn test_malformed_update_keeps_previous_snapshot() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    join(&mut guest, &mut host, session);
    let before = guest.controller.metadata().clone();

    host.controller
        .transport()
        .set_session_metadata(session, "this is not a lobby")
        .unwrap();
    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.metadata(), &before);
    assert_eq!(guest.controller.connection_state(), ConnectionState::Connected);
}

/// Test: Joining without the directory
#[test]
fn test_join_without_directory_fails_fast() {
    let directory = MemoryDirectory::new();
    let (_host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");

    directory.set_available(false);
    assert_eq!(
        guest.controller.join_session(session),
        Err(LobbyError::ConnectionFailed)
    );
    assert_eq!(guest.controller.connection_state(), ConnectionState::Failed);
}

/// Test: A join completing after cancel is undone
/// When a join is cancelled before its completion is handled
/// Then the guest stays CANCELLED and its membership is given back
#[test]
fn test_cancelled_join_is_left() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    let guest_peer = guest.controller.local_peer();

    guest.controller.join_session(session).unwrap();
    assert!(guest.controller.cancel_connect());
    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.connection_state(), ConnectionState::Cancelled);
    assert!(!directory.is_member(session, guest_peer));
    assert_eq!(host.controller.metadata().used_slots, 1);
}

/// Test: A join that completes after a disconnect
/// Given a guest with a join in flight
/// When it disconnects before the join completes
/// Then the late completion is discarded and the session is left
#[test]
fn test_disconnect_discards_late_join() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    let mut guest = Peer::new(&directory, "Bob");
    let guest_peer = guest.controller.local_peer();

    assert_ok!(guest.controller.join_session(session));
    guest.controller.disconnect();
    assert_eq!(guest.controller.connection_state(), ConnectionState::Disconnected);

    settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.controller.connection_state(), ConnectionState::Disconnected);
    assert!(guest.controller.session_id().is_none());
    assert!(!directory.is_member(session, guest_peer));
    assert_eq!(host.controller.metadata().used_slots, 1);
}

/// Test: Slot limit reaches the directory
/// Given a session limited to two members
/// When a third peer tries to join
/// Then the join fails
#[test]
fn test_slot_limit_applies_to_joins() {
    let directory = MemoryDirectory::new();
    let (mut host, session) = host_session(&directory, "Alice");
    // 2 -> 3 -> 4 -> 5 -> 2
    for _ in 0..4 {
        host.controller.adjust_slot_count().unwrap();
    }
    assert_eq!(host.controller.metadata().total_slots, 2);

    let mut bob = Peer::new(&directory, "Bob");
    join(&mut bob, &mut host, session);

    let mut carol = Peer::new(&directory, "Carol");
    carol.controller.join_session(session).unwrap();
    settle(&mut [&mut host, &mut bob, &mut carol]);
    assert_eq!(carol.controller.connection_state(), ConnectionState::Failed);
}
