//! Session controller: the lobby state machine
//!
//! Owns the session metadata and readiness map, enforces host authority on
//! every shared write, and reconciles completions and notifications from the
//! directory. All methods run on one owner (see [`super::LobbyService`]), so
//! there is no internal locking. Completions that arrive after the state they
//! belong to has moved on are detected and discarded.
//!
//! ```text
//! Connection:
//! [*] --> Undefined
//! Undefined/Failed/Disconnected/Cancelled --> Connecting: create/join
//! Connecting --> Connected: completion (join: snapshot fetched)
//! Connecting --> Failed: directory unavailable / request failed
//! Connecting --> Cancelled: cancel_connect()
//! Connected --> Disconnecting --> Disconnected: disconnect()
//!
//! Phase:
//! None --> Menu <--> AwaitingDownload <--> ItemSelected
//! AwaitingDownload/ItemSelected --> InActivity --> Menu
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::directory::SessionBrowser;
use super::error::{LobbyError, MetadataError};
use super::metadata::{ActivityModifiers, Phase, SessionMetadata, DEFAULT_MAX_SLOTS, MIN_SLOTS};
use super::player_info::{PlayerInfo, PlayerInfoChannel};
use super::readiness::PeerReadiness;
use crate::transport::{
    AuthorityOracle, DirectoryBackend, PeerId, SessionFilter, SessionHandle, TransportAdapter,
    TransportError, TransportEvent, Visibility,
};

/// Status line shown while the session sits in the menu
pub const STATUS_IN_MENU: &str = "Waiting In Menu";

/// Capacity of the notice channel
const NOTICE_CAPACITY: usize = 64;

/// Connection lifecycle of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Undefined,
    Connecting,
    Cancelled,
    Connected,
    Failed,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// Whether this attempt is over (a new create/join starts a fresh one)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Cancelled)
    }
}

/// What happened to a metadata push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Written to the directory
    Sent,
    /// The local peer is not the host; nothing was written
    NotHost,
    /// No session to write to
    NoSession,
}

/// One-way notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyNotice {
    ConnectionChanged(ConnectionState),
    MetadataUpdated,
    DirectoryRefreshed { sessions: usize },
    PlayerInfoReceived { peer: PeerId, info: PlayerInfo },
    /// The host asked everyone to acquire `item_id`
    ContentRequested { item_id: String },
}

/// Session parameters used when creating a session
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub visibility: Visibility,
    pub max_slots: usize,
    pub default_modifiers: ActivityModifiers,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            visibility: Visibility::Public,
            max_slots: DEFAULT_MAX_SLOTS,
            default_modifiers: ActivityModifiers::default(),
        }
    }
}

/// Every mutation the controller accepts, as a value
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyOp {
    CreateSession,
    JoinSession(SessionHandle),
    CancelConnect,
    SelectItem { item_id: String, item_name: String },
    SelectDifficulty(u8),
    RequestStart(ActivityModifiers),
    SetDownloading(bool),
    MarkReady,
    ConfirmItem,
    BeginActivity,
    FinishActivity,
    Stop,
    Reset,
    ToggleJoinable,
    AdjustSlotCount,
    PlayerConnected,
    PlayerDisconnected,
    RefreshDirectory(SessionFilter),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRequest {
    Create,
    Join(SessionHandle),
}

/// The lobby state machine for one local peer
pub struct SessionController<B> {
    transport: TransportAdapter<B>,
    authority: Arc<dyn AuthorityOracle>,
    config: ControllerConfig,
    metadata: SessionMetadata,
    readiness: PeerReadiness,
    player_info: PlayerInfoChannel,
    browser: SessionBrowser,
    connection: ConnectionState,
    pending: Option<PendingRequest>,
    notices: broadcast::Sender<LobbyNotice>,
}

impl<B: DirectoryBackend + 'static> SessionController<B> {
    /// Controller whose authority checks go to the transport itself
    pub fn new(transport: TransportAdapter<B>, config: ControllerConfig) -> Self {
        let authority = Arc::new(transport.clone());
        Self::with_authority(transport, authority, config)
    }
}

impl<B: DirectoryBackend> SessionController<B> {
    /// Controller with a separately injected authority oracle
    pub fn with_authority(
        transport: TransportAdapter<B>,
        authority: Arc<dyn AuthorityOracle>,
        config: ControllerConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            transport,
            authority,
            config,
            metadata: SessionMetadata::default(),
            readiness: PeerReadiness::new(),
            player_info: PlayerInfoChannel::new(),
            browser: SessionBrowser::new(),
            connection: ConnectionState::Undefined,
            pending: None,
            notices,
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn readiness(&self) -> &PeerReadiness {
        &self.readiness
    }

    pub fn browser(&self) -> &SessionBrowser {
        &self.browser
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn session_id(&self) -> SessionHandle {
        self.metadata.session_id
    }

    pub fn local_player_info(&self) -> PlayerInfo {
        self.player_info.local()
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn transport(&self) -> &TransportAdapter<B> {
        &self.transport
    }

    /// Subscribe to presentation notices
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<LobbyNotice> {
        self.notices.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.metadata.is_session()
    }

    /// Whether the local peer currently holds host authority.
    ///
    /// Asked fresh from the authority oracle on every call. Without a
    /// session the local state is nobody else's, so the answer is yes.
    pub fn is_host(&self) -> bool {
        let session = self.metadata.session_id;
        if session.is_none() {
            return true;
        }
        match self.authority.is_authority(session) {
            Ok(host) => host,
            Err(e) => {
                warn!("Could not determine owner of session {}: {}", session, e);
                false
            }
        }
    }

    fn notify(&self, notice: LobbyNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!("Connection state {:?} -> {:?}", self.connection, state);
            self.connection = state;
            self.notify(LobbyNotice::ConnectionChanged(state));
        }
    }

    /// Gate for host-only mutators. Non-hosts are ignored without error.
    fn host_gate(&self, op: &str) -> bool {
        if self.is_host() {
            true
        } else {
            debug!("{} ignored: not the session host", op);
            false
        }
    }

    /// Publish the local metadata if we are the host.
    ///
    /// Every host-side mutation calls this once, in call order.
    pub fn push(&self) -> Result<PushOutcome, LobbyError> {
        let session = self.metadata.session_id;
        if session.is_none() {
            return Ok(PushOutcome::NoSession);
        }
        if !self.authority.is_authority(session)? {
            debug!("Metadata push for {} skipped: not the session host", session);
            return Ok(PushOutcome::NotHost);
        }

        self.transport
            .set_session_metadata(session, &self.metadata.serialize())?;
        trace!("Pushed metadata for {}: {:?}", session, self.metadata.phase);
        self.notify(LobbyNotice::MetadataUpdated);
        Ok(PushOutcome::Sent)
    }

    fn set_status(&mut self, status: &str) {
        debug!("Update session status to {}", status);
        self.metadata.status = status.to_string();
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Ask the directory for a new session hosted by the local peer.
    /// Completes when `SessionCreated` is handled.
    pub fn create_session(&mut self) -> Result<(), LobbyError> {
        if self.is_connected() {
            debug!("Already in session {}, not creating another", self.metadata.session_id);
            return Err(LobbyError::AlreadyConnected);
        }
        if !self.transport.is_ready() {
            error!("CONNECTION FAILED");
            self.set_connection(ConnectionState::Failed);
            return Err(LobbyError::ConnectionFailed);
        }

        info!("Creating a session");
        self.metadata = SessionMetadata::default();
        self.readiness.clear_all();
        self.player_info.reset();
        self.pending = Some(PendingRequest::Create);
        self.set_connection(ConnectionState::Connecting);

        if let Err(e) = self
            .transport
            .create_session(self.config.visibility, self.config.max_slots)
        {
            error!("Session creation failed: {}", e);
            self.pending = None;
            self.set_connection(ConnectionState::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Join `handle`, leaving any current session first.
    /// Completes when `SessionEntered` is handled and the snapshot fetched.
    pub fn join_session(&mut self, handle: SessionHandle) -> Result<(), LobbyError> {
        if !self.transport.is_ready() {
            error!("CONNECTION FAILED");
            self.set_connection(ConnectionState::Failed);
            return Err(LobbyError::ConnectionFailed);
        }
        if self.metadata.is_session() {
            debug!("We are already in another session, disconnecting first");
            self.disconnect();
        }

        info!("Joining session {}", handle);
        self.metadata = SessionMetadata::default();
        self.readiness.clear_all();
        self.player_info.reset();
        self.pending = Some(PendingRequest::Join(handle));
        self.set_connection(ConnectionState::Connecting);

        if let Err(e) = self.transport.join_session(handle) {
            error!("Joining session {} failed: {}", handle, e);
            self.pending = None;
            self.set_connection(ConnectionState::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Abandon an in-flight create/join. Its completion will be discarded.
    pub fn cancel_connect(&mut self) -> bool {
        if !self.connection.is_connecting() {
            return false;
        }
        info!("Cancelling pending connection");
        self.pending = None;
        self.set_connection(ConnectionState::Cancelled);
        true
    }

    /// Tear down the current session. Every step runs even if an earlier
    /// one fails; failures are logged.
    pub fn disconnect(&mut self) {
        info!("Disconnect from current session");
        let session = self.metadata.session_id;
        self.set_connection(ConnectionState::Disconnecting);
        self.pending = None;

        // Empty host name tells followers the session is going away
        self.metadata.host_display_name.clear();
        if let Err(e) = self.push() {
            warn!("Failed to publish teardown for {}: {}", session, e);
        }

        self.metadata = SessionMetadata::default();

        if !session.is_none() {
            if let Err(e) = self.transport.leave_session(session) {
                warn!("Failed to leave session {}: {}", session, e);
            }
        }

        self.readiness.clear_all();
        self.player_info.reset();
        self.set_connection(ConnectionState::Disconnected);
    }

    // ------------------------------------------------------------------
    // Selection and phase transitions
    // ------------------------------------------------------------------

    /// Host-only: choose the shared item. Legal in any phase.
    pub fn select_item(&mut self, item_id: &str, item_name: &str) -> Result<(), LobbyError> {
        if !self.host_gate("select_item") {
            return Ok(());
        }
        debug!("We want to play {} - {}", item_id, item_name);
        self.metadata.current_item_id = item_id.to_string();
        self.metadata.current_item_name = item_name.to_string();
        self.push()?;
        Ok(())
    }

    /// Host-only: choose the difficulty. Legal in any phase.
    pub fn select_difficulty(&mut self, difficulty: u8) -> Result<(), LobbyError> {
        if !self.host_gate("select_difficulty") {
            return Ok(());
        }
        debug!("We want to play on {}", difficulty);
        self.metadata.current_item_difficulty = difficulty;
        self.push()?;
        Ok(())
    }

    /// Host-only: move everyone to AWAITING_DOWNLOAD so followers fetch the
    /// selected item and report ready.
    pub fn request_start(&mut self, modifiers: ActivityModifiers) -> Result<(), LobbyError> {
        if !self.host_gate("request_start") {
            return Ok(());
        }
        if self.metadata.phase == Phase::InActivity {
            return Err(LobbyError::InvalidPhase {
                from: self.metadata.phase,
                to: Phase::AwaitingDownload,
            });
        }

        debug!("Switching to the waiting screen while peers fetch the item");
        if !self.metadata.current_item_name.is_empty() {
            let status = format!("Loading {}", self.metadata.current_item_name);
            self.set_status(&status);
        }
        self.readiness.clear_all();
        self.metadata.activity_modifiers = modifiers;
        self.metadata.phase = Phase::AwaitingDownload;
        self.push()?;
        Ok(())
    }

    /// Report local content progress to the other peers
    pub fn set_downloading(&mut self, downloading: bool) -> Result<(), LobbyError> {
        let session = self.metadata.session_id;
        self.player_info
            .update(&self.transport, session, |info| info.downloading = downloading)?;
        Ok(())
    }

    /// Mark the local peer ready. Alone in the session, the activity starts
    /// immediately from whatever phase we are in; otherwise the host starts
    /// once every member has reported ready.
    pub fn mark_ready(&mut self) -> Result<(), LobbyError> {
        let session = self.metadata.session_id;
        if !self.is_connected() {
            return Err(LobbyError::NotConnected);
        }
        let me = self.local_peer();
        let peers = self.transport.enumerate_peers(session)?;

        debug!("Broadcast to our session that we are ready");
        self.readiness.set_ready(me);
        if let Err(e) = self.player_info.update(&self.transport, session, |info| {
            info.ready = true;
            info.downloading = false;
        }) {
            warn!("Failed to broadcast readiness: {}", e);
        }

        if peers.iter().all(|&peer| peer == me) {
            return self.start_alone();
        }

        self.maybe_begin_activity();
        Ok(())
    }

    /// Solo continuation: no one to wait for, so no phase gate
    fn start_alone(&mut self) -> Result<(), LobbyError> {
        if !self.host_gate("start_alone") || self.metadata.phase == Phase::InActivity {
            return Ok(());
        }
        info!("Alone in the session, starting right away");
        self.metadata.phase = Phase::InActivity;
        self.push()?;
        Ok(())
    }

    /// Remove `peer`'s readiness. With `broadcast` and `peer` being the local
    /// peer, also tell the others we are no longer downloading.
    pub fn clear_ready(&mut self, peer: PeerId, broadcast: bool) {
        self.readiness.clear(peer);
        if !broadcast {
            return;
        }
        if peer != self.local_peer() {
            debug!("Not broadcasting readiness clear for remote {}", peer);
            return;
        }

        debug!("Broadcast to our session that our ready status should be cleared");
        let session = self.metadata.session_id;
        if let Err(e) = self.player_info.update(&self.transport, session, |info| {
            info.downloading = false;
            info.ready = false;
        }) {
            warn!("Failed to broadcast readiness clear: {}", e);
        }
    }

    /// Host-only: every peer has the item, AWAITING_DOWNLOAD -> ITEM_SELECTED
    pub fn confirm_item(&mut self) -> Result<(), LobbyError> {
        if !self.host_gate("confirm_item") {
            return Ok(());
        }
        if self.metadata.phase != Phase::AwaitingDownload {
            return Err(LobbyError::InvalidPhase {
                from: self.metadata.phase,
                to: Phase::ItemSelected,
            });
        }
        self.metadata.phase = Phase::ItemSelected;
        self.push()?;
        Ok(())
    }

    /// Host-only: AWAITING_DOWNLOAD or ITEM_SELECTED -> IN_ACTIVITY
    pub fn begin_activity(&mut self) -> Result<(), LobbyError> {
        if !self.host_gate("begin_activity") {
            return Ok(());
        }
        match self.metadata.phase {
            Phase::AwaitingDownload | Phase::ItemSelected => {}
            from => {
                return Err(LobbyError::InvalidPhase {
                    from,
                    to: Phase::InActivity,
                })
            }
        }

        info!("Starting {}", self.metadata.current_item_name);
        self.metadata.phase = Phase::InActivity;
        self.push()?;
        Ok(())
    }

    /// The activity ended: clear readiness, back to the menu
    pub fn finish_activity(&mut self) -> Result<(), LobbyError> {
        debug!("We have finished the activity");
        self.readiness.clear_all();
        let me = self.local_peer();
        self.clear_ready(me, true);

        self.metadata.phase = Phase::Menu;
        self.set_status(STATUS_IN_MENU);
        self.push()?;
        Ok(())
    }

    /// Abort mid-selection and return to the menu
    pub fn stop(&mut self) -> Result<(), LobbyError> {
        debug!("Broadcast to the session that we are back on the menu");
        self.metadata.phase = Phase::Menu;
        self.set_status(STATUS_IN_MENU);
        self.push()?;
        Ok(())
    }

    /// Leave item selection entirely
    pub fn reset(&mut self) -> Result<(), LobbyError> {
        debug!("Clear the current screen from the session");
        self.metadata.phase = Phase::None;
        self.push()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Slots and admission
    // ------------------------------------------------------------------

    /// Host-only: flip whether new peers may join
    pub fn toggle_joinable(&mut self) -> Result<(), LobbyError> {
        if !self.host_gate("toggle_joinable") {
            return Ok(());
        }
        self.metadata.joinable = !self.metadata.joinable;
        let session = self.metadata.session_id;
        if !session.is_none() {
            self.transport.set_joinable(session, self.metadata.joinable)?;
        }
        self.push()?;
        Ok(())
    }

    /// Host-only: one more slot, wrapping to the minimum past `max_slots`
    pub fn adjust_slot_count(&mut self) -> Result<(), LobbyError> {
        if !self.host_gate("adjust_slot_count") {
            return Ok(());
        }
        self.metadata.total_slots += 1;
        if self.metadata.total_slots > self.metadata.max_slots {
            self.metadata.total_slots = MIN_SLOTS;
        }
        debug!("Changing the session slots to {}", self.metadata.total_slots);

        self.push()?;
        let session = self.metadata.session_id;
        if !session.is_none() {
            self.transport
                .set_member_limit(session, self.metadata.total_slots)?;
        }
        Ok(())
    }

    /// Observed member count +1. Advisory, not a reservation.
    pub fn player_connected(&mut self) -> Result<(), LobbyError> {
        self.metadata.used_slots += 1;
        self.push()?;
        Ok(())
    }

    /// Observed member count -1. Advisory, not a reservation.
    pub fn player_disconnected(&mut self) -> Result<(), LobbyError> {
        self.metadata.used_slots = self.metadata.used_slots.saturating_sub(1);
        self.push()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    /// Request a fresh session listing; handled in `ListReceived`
    pub fn refresh_directory(&mut self, filter: SessionFilter) -> Result<(), LobbyError> {
        debug!("Requesting list of all sessions");
        self.transport.list_sessions(filter)?;
        Ok(())
    }

    /// (display name, ready) for every current member
    pub fn member_statuses(&self) -> Vec<(String, bool)> {
        let session = self.metadata.session_id;
        if session.is_none() {
            return Vec::new();
        }
        match self.transport.enumerate_peers(session) {
            Ok(peers) => peers
                .into_iter()
                .map(|peer| {
                    let name = self
                        .transport
                        .display_name(peer)
                        .unwrap_or_else(|_| peer.to_string());
                    (name, self.readiness.is_ready(peer))
                })
                .collect(),
            Err(e) => {
                warn!("Failed to list members of {}: {}", session, e);
                Vec::new()
            }
        }
    }

    /// Apply one [`LobbyOp`]
    pub fn apply(&mut self, op: LobbyOp) -> Result<(), LobbyError> {
        match op {
            LobbyOp::CreateSession => self.create_session(),
            LobbyOp::JoinSession(handle) => self.join_session(handle),
            LobbyOp::CancelConnect => {
                self.cancel_connect();
                Ok(())
            }
            LobbyOp::SelectItem { item_id, item_name } => self.select_item(&item_id, &item_name),
            LobbyOp::SelectDifficulty(difficulty) => self.select_difficulty(difficulty),
            LobbyOp::RequestStart(modifiers) => self.request_start(modifiers),
            LobbyOp::SetDownloading(downloading) => self.set_downloading(downloading),
            LobbyOp::MarkReady => self.mark_ready(),
            LobbyOp::ConfirmItem => self.confirm_item(),
            LobbyOp::BeginActivity => self.begin_activity(),
            LobbyOp::FinishActivity => self.finish_activity(),
            LobbyOp::Stop => self.stop(),
            LobbyOp::Reset => self.reset(),
            LobbyOp::ToggleJoinable => self.toggle_joinable(),
            LobbyOp::AdjustSlotCount => self.adjust_slot_count(),
            LobbyOp::PlayerConnected => self.player_connected(),
            LobbyOp::PlayerDisconnected => self.player_disconnected(),
            LobbyOp::RefreshDirectory(filter) => self.refresh_directory(filter),
            LobbyOp::Disconnect => {
                self.disconnect();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Directory events
    // ------------------------------------------------------------------

    /// Reconcile one event from the directory. Never fails: problems are
    /// logged and the event's contribution dropped.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SessionCreated { result } => match result {
                Ok(handle) => self.on_session_created(handle),
                Err(e) => self.on_create_failed(e.to_string()),
            },
            TransportEvent::SessionEntered { handle, result } => {
                self.on_session_entered(handle, result.map_err(|e| e.to_string()))
            }
            TransportEvent::ListReceived { handles } => {
                let current = self.metadata.session_id;
                let sessions = self.browser.reconcile(&self.transport, current, &handles);
                self.notify(LobbyNotice::DirectoryRefreshed { sessions });
            }
            TransportEvent::MetadataChanged { handle } => self.on_metadata_changed(handle),
            TransportEvent::PeerJoined { handle, peer } => {
                if !self.is_current(handle) {
                    return;
                }
                info!("{} joined the session", peer);
                if let Err(e) = self.player_connected() {
                    warn!("Failed to record joined peer {}: {}", peer, e);
                }
            }
            TransportEvent::PeerLeft { handle, peer } => {
                if !self.is_current(handle) {
                    return;
                }
                info!("{} left the session", peer);
                self.clear_ready(peer, false);
                if let Err(TransportError::SessionNotFound(_)) = self.transport.enumerate_peers(handle) {
                    info!("Session {} closed", handle);
                    self.disconnect();
                    return;
                }
                if let Err(e) = self.player_disconnected() {
                    warn!("Failed to record departed peer {}: {}", peer, e);
                }
                self.maybe_begin_activity();
            }
            TransportEvent::PeerMessage { from, payload } => self.on_peer_message(from, &payload),
        }
    }

    fn is_current(&self, handle: SessionHandle) -> bool {
        self.is_connected() && handle == self.metadata.session_id
    }

    fn on_session_created(&mut self, handle: SessionHandle) {
        let expected =
            self.pending == Some(PendingRequest::Create) && self.connection.is_connecting();
        if !expected {
            warn!("Discarding stale session creation {}, leaving it", handle);
            if let Err(e) = self.transport.leave_session(handle) {
                warn!("Failed to leave stale session {}: {}", handle, e);
            }
            return;
        }
        self.pending = None;

        let me = self.local_peer();
        let host_name = self
            .transport
            .display_name(me)
            .unwrap_or_else(|_| me.to_string());
        info!("Session {} has been created", handle);

        self.metadata = SessionMetadata::hosted(handle, &host_name, self.config.max_slots);
        self.metadata.used_slots = 1;
        self.metadata.activity_modifiers = self.config.default_modifiers;
        self.set_status(STATUS_IN_MENU);
        self.set_connection(ConnectionState::Connected);

        if let Err(e) = self.push() {
            warn!("Failed to publish metadata for new session {}: {}", handle, e);
        }
    }

    fn on_create_failed(&mut self, reason: String) {
        if self.pending != Some(PendingRequest::Create) || !self.connection.is_connecting() {
            debug!("Ignoring stale session creation failure: {}", reason);
            return;
        }
        error!("Session creation failed: {}", reason);
        self.pending = None;
        self.set_connection(ConnectionState::Failed);
    }

    fn on_session_entered(&mut self, handle: SessionHandle, result: Result<(), String>) {
        let expected =
            self.pending == Some(PendingRequest::Join(handle)) && self.connection.is_connecting();
        if !expected {
            if result.is_ok() && handle != self.metadata.session_id {
                warn!("Discarding stale join of {}, leaving it", handle);
                if let Err(e) = self.transport.leave_session(handle) {
                    warn!("Failed to leave stale session {}: {}", handle, e);
                }
            }
            return;
        }
        self.pending = None;

        if let Err(reason) = result {
            error!("Joining session {} failed: {}", handle, reason);
            self.set_connection(ConnectionState::Failed);
            return;
        }

        let snapshot = self
            .transport
            .get_session_metadata(handle)
            .map_err(LobbyError::from)
            .and_then(|blob| SessionMetadata::parse(&blob).map_err(LobbyError::from));

        match snapshot {
            Ok(mut metadata) => {
                metadata.session_id = handle;
                self.metadata = metadata;
            }
            Err(LobbyError::Metadata(MetadataError::Empty)) => {
                debug!("Session {} has no metadata yet", handle);
                self.metadata = SessionMetadata {
                    session_id: handle,
                    ..SessionMetadata::default()
                };
            }
            Err(e) => {
                warn!("Joined session {} but its metadata is unusable: {}", handle, e);
                if let Err(e) = self.transport.leave_session(handle) {
                    warn!("Failed to leave session {}: {}", handle, e);
                }
                self.metadata = SessionMetadata::default();
                self.set_connection(ConnectionState::Failed);
                return;
            }
        }

        info!("Joined session {} hosted by {}", handle, self.metadata.host_display_name);
        self.set_connection(ConnectionState::Connected);
        self.notify(LobbyNotice::MetadataUpdated);
        if self.metadata.phase == Phase::AwaitingDownload {
            self.notify(LobbyNotice::ContentRequested {
                item_id: self.metadata.current_item_id.clone(),
            });
        }
    }

    fn on_metadata_changed(&mut self, handle: SessionHandle) {
        if !self.is_current(handle) {
            if self.browser.refresh_entry(&self.transport, handle) {
                self.notify(LobbyNotice::DirectoryRefreshed {
                    sessions: self.browser.len(),
                });
            }
            return;
        }
        if self.is_host() {
            trace!("Ignoring echo of our own metadata");
            return;
        }

        let blob = match self.transport.get_session_metadata(handle) {
            Ok(blob) => blob,
            Err(TransportError::SessionNotFound(_)) => {
                info!("Session {} closed", handle);
                self.disconnect();
                return;
            }
            Err(e) => {
                warn!("Failed to fetch metadata of {}: {}", handle, e);
                return;
            }
        };
        let mut incoming = match SessionMetadata::parse(&blob) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Keeping previous snapshot of {}: {}", handle, e);
                return;
            }
        };
        incoming.session_id = handle;

        let previous = self.metadata.phase;
        self.metadata = incoming;
        self.notify(LobbyNotice::MetadataUpdated);

        if self.metadata.host_display_name.is_empty() {
            info!("Host closed session {}", handle);
            self.disconnect();
            return;
        }

        if self.metadata.phase == previous {
            return;
        }
        match self.metadata.phase {
            Phase::AwaitingDownload => self.notify(LobbyNotice::ContentRequested {
                item_id: self.metadata.current_item_id.clone(),
            }),
            Phase::Menu | Phase::None => {
                self.readiness.clear_all();
                let me = self.local_peer();
                self.clear_ready(me, true);
            }
            Phase::ItemSelected | Phase::InActivity => {}
        }
    }

    fn on_peer_message(&mut self, from: PeerId, payload: &[u8]) {
        let session = self.metadata.session_id;
        if !self.is_connected() {
            debug!("Ignoring message from {} outside a session", from);
            return;
        }
        match self.transport.enumerate_peers(session) {
            Ok(peers) if peers.contains(&from) => {}
            Ok(_) => {
                debug!("Ignoring message from {} who is not in our session", from);
                return;
            }
            Err(e) => {
                warn!("Failed to check membership of {}: {}", from, e);
                return;
            }
        }

        let info = match PlayerInfo::decode(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!("Malformed player info from {}: {}", from, e);
                return;
            }
        };

        if info.ready {
            self.readiness.set_ready(from);
        } else {
            self.readiness.clear(from);
        }
        self.notify(LobbyNotice::PlayerInfoReceived { peer: from, info });
        self.maybe_begin_activity();
    }

    /// Host continuation: start once every member is ready
    fn maybe_begin_activity(&mut self) {
        if self.metadata.phase != Phase::AwaitingDownload || !self.is_host() {
            return;
        }
        let session = self.metadata.session_id;
        if session.is_none() {
            return;
        }
        let peers = match self.transport.enumerate_peers(session) {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Failed to enumerate members of {}: {}", session, e);
                return;
            }
        };
        if self.readiness.all_ready(&peers) {
            info!("Everyone is ready");
            if let Err(e) = self.begin_activity() {
                warn!("Failed to begin activity: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBackend, MemoryDirectory};

    /// Authority fixed at construction, for exercising the gate without a
    /// second peer
    struct FixedAuthority {
        local: PeerId,
        owner: PeerId,
    }

    impl AuthorityOracle for FixedAuthority {
        fn local_peer(&self) -> PeerId {
            self.local
        }

        fn session_owner(&self, _handle: SessionHandle) -> Result<PeerId, TransportError> {
            Ok(self.owner)
        }
    }

    fn hosted_controller() -> (
        MemoryDirectory,
        SessionController<MemoryBackend>,
        tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let directory = MemoryDirectory::new();
        let (backend, mut events) = directory.connect("Alice");
        let mut controller =
            SessionController::new(TransportAdapter::new(backend), ControllerConfig::default());
        controller.create_session().unwrap();
        while let Ok(event) = events.try_recv() {
            controller.handle_event(event);
        }
        (directory, controller, events)
    }

    #[test]
    fn test_create_session_defaults() {
        let (_directory, controller, _events) = hosted_controller();
        assert_eq!(controller.connection_state(), ConnectionState::Connected);
        let metadata = controller.metadata();
        assert!(metadata.is_session());
        assert_eq!(metadata.host_display_name, "Alice");
        assert_eq!(metadata.total_slots, 2);
        assert_eq!(metadata.max_slots, 5);
        assert_eq!(metadata.used_slots, 1);
        assert_eq!(metadata.status, STATUS_IN_MENU);
        assert_eq!(metadata.phase, Phase::None);
        assert!(controller.is_host());
    }

    #[test]
    fn test_create_while_connected_is_rejected() {
        let (_directory, mut controller, _events) = hosted_controller();
        assert_eq!(controller.create_session(), Err(LobbyError::AlreadyConnected));
    }

    #[test]
    fn test_create_without_directory_fails() {
        let directory = MemoryDirectory::new();
        let (backend, _events) = directory.connect("Alice");
        let mut controller =
            SessionController::new(TransportAdapter::new(backend), ControllerConfig::default());
        directory.set_available(false);

        assert_eq!(controller.create_session(), Err(LobbyError::ConnectionFailed));
        assert_eq!(controller.connection_state(), ConnectionState::Failed);
    }

    #[test]
    fn test_slot_count_wraps_at_max() {
        let (directory, mut controller, _events) = hosted_controller();
        let session = controller.session_id();
        let mut seen = Vec::new();
        for _ in 0..4 {
            controller.adjust_slot_count().unwrap();
            seen.push(controller.metadata().total_slots);
        }
        assert_eq!(seen, vec![3, 4, 5, 2]);
        assert_eq!(directory.member_limit(session), Some(2));
    }

    #[test]
    fn test_non_host_mutators_leave_metadata_unchanged() {
        let (_directory, controller, _events) = hosted_controller();
        let transport = controller.transport().clone();
        let session = controller.session_id();
        let authority = Arc::new(FixedAuthority {
            local: transport.local_peer(),
            owner: PeerId(9999),
        });
        let mut follower =
            SessionController::with_authority(transport, authority, ControllerConfig::default());
        follower.metadata = controller.metadata().clone();
        follower.connection = ConnectionState::Connected;
        assert_eq!(follower.session_id(), session);

        let before = follower.metadata().clone();
        follower.select_item("abc123", "Song A").unwrap();
        follower.select_difficulty(3).unwrap();
        follower.request_start(ActivityModifiers::default()).unwrap();
        follower.begin_activity().unwrap();
        follower.confirm_item().unwrap();
        follower.toggle_joinable().unwrap();
        follower.adjust_slot_count().unwrap();
        assert_eq!(follower.metadata(), &before);
        assert_eq!(follower.push().unwrap(), PushOutcome::NotHost);
    }

    #[test]
    fn test_begin_activity_requires_waiting_phase() {
        let (_directory, mut controller, _events) = hosted_controller();
        assert_eq!(
            controller.begin_activity(),
            Err(LobbyError::InvalidPhase {
                from: Phase::None,
                to: Phase::InActivity
            })
        );
        controller.request_start(ActivityModifiers::default()).unwrap();
        controller.confirm_item().unwrap();
        controller.begin_activity().unwrap();
        assert_eq!(controller.metadata().phase, Phase::InActivity);
        assert!(matches!(
            controller.request_start(ActivityModifiers::default()),
            Err(LobbyError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_solo_mark_ready_starts_activity() {
        let (_directory, mut controller, _events) = hosted_controller();
        controller.select_item("abc123", "Song A").unwrap();
        controller.request_start(ActivityModifiers::default()).unwrap();
        assert_eq!(controller.metadata().phase, Phase::AwaitingDownload);
        assert_eq!(controller.metadata().status, "Loading Song A");

        controller.mark_ready().unwrap();
        assert_eq!(controller.metadata().phase, Phase::InActivity);
    }

    #[test]
    fn test_solo_mark_ready_from_menu_starts_activity() {
        let (_directory, mut controller, _events) = hosted_controller();
        controller.stop().unwrap();
        assert_eq!(controller.metadata().phase, Phase::Menu);

        controller.mark_ready().unwrap();
        assert_eq!(controller.metadata().phase, Phase::InActivity);
        assert!(controller.readiness().is_ready(controller.local_peer()));

        // Already playing: marking ready again is a no-op
        controller.mark_ready().unwrap();
        assert_eq!(controller.metadata().phase, Phase::InActivity);
    }

    #[test]
    fn test_finish_activity_clears_readiness() {
        let (_directory, mut controller, _events) = hosted_controller();
        controller.request_start(ActivityModifiers::default()).unwrap();
        controller.readiness.set_ready(PeerId(77));
        controller.mark_ready().unwrap();
        assert!(controller.readiness().ready_count() > 0);

        controller.finish_activity().unwrap();
        assert!(controller.readiness().is_empty());
        assert!(!controller.readiness().is_ready(PeerId(77)));
        assert_eq!(controller.metadata().phase, Phase::Menu);
        assert_eq!(controller.metadata().status, STATUS_IN_MENU);
        assert!(!controller.local_player_info().ready);
    }

    #[test]
    fn test_mark_ready_requires_session() {
        let directory = MemoryDirectory::new();
        let (backend, _events) = directory.connect("Alice");
        let mut controller =
            SessionController::new(TransportAdapter::new(backend), ControllerConfig::default());
        assert_eq!(controller.mark_ready(), Err(LobbyError::NotConnected));
    }

    #[test]
    fn test_used_slots_never_negative() {
        let (_directory, mut controller, _events) = hosted_controller();
        controller.player_disconnected().unwrap();
        controller.player_disconnected().unwrap();
        assert_eq!(controller.metadata().used_slots, 0);
        controller.player_connected().unwrap();
        assert_eq!(controller.metadata().used_slots, 1);
    }

    #[test]
    fn test_cancel_discards_late_creation() {
        let directory = MemoryDirectory::new();
        let (backend, mut events) = directory.connect("Alice");
        let mut controller =
            SessionController::new(TransportAdapter::new(backend), ControllerConfig::default());

        controller.create_session().unwrap();
        assert!(controller.cancel_connect());
        assert_eq!(controller.connection_state(), ConnectionState::Cancelled);

        let late = match events.try_recv().unwrap() {
            TransportEvent::SessionCreated { result } => result.unwrap(),
            other => panic!("unexpected event {:?}", other),
        };
        controller.handle_event(TransportEvent::SessionCreated { result: Ok(late) });

        assert_eq!(controller.connection_state(), ConnectionState::Cancelled);
        assert!(!controller.metadata().is_session());
        // The orphaned session was left, which closes it
        assert!(!directory.session_exists(late));
    }

    #[test]
    fn test_toggle_joinable_propagates() {
        let (directory, mut controller, _events) = hosted_controller();
        let session = controller.session_id();
        controller.toggle_joinable().unwrap();
        assert!(!controller.metadata().joinable);
        assert_eq!(directory.is_joinable(session), Some(false));
        controller.toggle_joinable().unwrap();
        assert_eq!(directory.is_joinable(session), Some(true));
    }

    #[test]
    fn test_apply_dispatches_ops() {
        let (_directory, mut controller, _events) = hosted_controller();
        controller
            .apply(LobbyOp::SelectItem {
                item_id: "abc123".to_string(),
                item_name: "Song A".to_string(),
            })
            .unwrap();
        controller.apply(LobbyOp::SelectDifficulty(3)).unwrap();
        assert_eq!(controller.metadata().current_item_id, "abc123");
        assert_eq!(controller.metadata().current_item_difficulty, 3);

        controller.apply(LobbyOp::Disconnect).unwrap();
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }
}
