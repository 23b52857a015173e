//! Lobby service actor
//!
//! A single task owns the [`SessionController`] and serializes user commands
//! with directory events, so no two mutations ever interleave. Callers talk
//! to it through a cloneable [`LobbyHandle`].

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use super::controller::{ConnectionState, LobbyNotice, LobbyOp, SessionController};
use super::error::LobbyError;
use super::metadata::{ActivityModifiers, SessionMetadata};
use crate::transport::{DirectoryBackend, SessionFilter, SessionHandle, TransportEvent};

/// Command queue depth
const COMMAND_CAPACITY: usize = 32;

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub connection: ConnectionState,
    pub metadata: SessionMetadata,
    pub is_host: bool,
    pub members: Vec<(String, bool)>,
    pub directory: Vec<SessionMetadata>,
}

enum Command {
    Apply {
        op: LobbyOp,
        resp: oneshot::Sender<Result<(), LobbyError>>,
    },
    Snapshot {
        resp: oneshot::Sender<LobbySnapshot>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Task that owns the controller
pub struct LobbyService<B> {
    controller: SessionController<B>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl<B: DirectoryBackend + 'static> LobbyService<B> {
    pub fn new(
        controller: SessionController<B>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, LobbyHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = LobbyHandle {
            commands: tx,
            notices: controller.notice_sender(),
        };
        let service = Self {
            controller,
            commands,
            events,
        };
        (service, handle)
    }

    /// Spawn the service on the current runtime
    pub fn spawn(
        controller: SessionController<B>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (tokio::task::JoinHandle<()>, LobbyHandle) {
        let (service, handle) = Self::new(controller, events);
        (tokio::spawn(service.run()), handle)
    }

    /// Run until every handle is dropped or shutdown is requested
    pub async fn run(mut self) {
        info!("Lobby service started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Apply { op, resp }) => {
                            debug!("Applying {:?}", op);
                            let _ = resp.send(self.controller.apply(op));
                        }
                        Some(Command::Snapshot { resp }) => {
                            let _ = resp.send(self.snapshot());
                        }
                        Some(Command::Shutdown { resp }) => {
                            self.controller.disconnect();
                            let _ = resp.send(());
                            break;
                        }
                        None => {
                            if self.controller.is_connected() {
                                self.controller.disconnect();
                            }
                            break;
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.controller.handle_event(event);
                }
            }
        }
        info!("Lobby service stopped");
    }

    fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            connection: self.controller.connection_state(),
            metadata: self.controller.metadata().clone(),
            is_host: self.controller.is_host(),
            members: self.controller.member_statuses(),
            directory: self
                .controller
                .browser()
                .entries()
                .map(|(_, metadata)| metadata.clone())
                .collect(),
        }
    }
}

/// Cloneable front for a running [`LobbyService`]
#[derive(Clone)]
pub struct LobbyHandle {
    commands: mpsc::Sender<Command>,
    notices: broadcast::Sender<LobbyNotice>,
}

impl LobbyHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyNotice> {
        self.notices.subscribe()
    }

    /// Send one operation and wait for its result
    pub async fn apply(&self, op: LobbyOp) -> Result<(), LobbyError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Apply { op, resp })
            .await
            .map_err(|_| LobbyError::ServiceStopped)?;
        rx.await.map_err(|_| LobbyError::ServiceStopped)?
    }

    pub async fn snapshot(&self) -> Result<LobbySnapshot, LobbyError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { resp })
            .await
            .map_err(|_| LobbyError::ServiceStopped)?;
        rx.await.map_err(|_| LobbyError::ServiceStopped)
    }

    /// Disconnect and stop the service
    pub async fn shutdown(&self) -> Result<(), LobbyError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { resp })
            .await
            .map_err(|_| LobbyError::ServiceStopped)?;
        rx.await.map_err(|_| LobbyError::ServiceStopped)
    }

    /// Apply a create/join and wait until it settles.
    ///
    /// Resolves to the session handle once connected. An attempt that ends
    /// failed yields `ConnectionFailed`; one that is cancelled or torn down
    /// yields `NotConnected`. Wrap in a timeout if the directory may stall.
    pub async fn connect(&self, op: LobbyOp) -> Result<SessionHandle, LobbyError> {
        let mut notices = self.subscribe();
        self.apply(op).await?;

        let mut attempt_started = false;
        loop {
            match notices.recv().await {
                Ok(LobbyNotice::ConnectionChanged(ConnectionState::Connecting)) => {
                    attempt_started = true;
                }
                Ok(LobbyNotice::ConnectionChanged(ConnectionState::Connected)) => break,
                Ok(LobbyNotice::ConnectionChanged(ConnectionState::Failed)) if attempt_started => {
                    return Err(LobbyError::ConnectionFailed)
                }
                Ok(LobbyNotice::ConnectionChanged(state)) if attempt_started && state.is_terminal() => {
                    return Err(LobbyError::NotConnected)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} lobby notices", skipped);
                    let snapshot = self.snapshot().await?;
                    if snapshot.connection.is_connected() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LobbyError::ServiceStopped),
            }
        }
        Ok(self.snapshot().await?.metadata.session_id)
    }

    pub async fn create_session(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::CreateSession).await
    }

    pub async fn join_session(&self, handle: SessionHandle) -> Result<(), LobbyError> {
        self.apply(LobbyOp::JoinSession(handle)).await
    }

    pub async fn cancel_connect(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::CancelConnect).await
    }

    pub async fn select_item(&self, item_id: &str, item_name: &str) -> Result<(), LobbyError> {
        self.apply(LobbyOp::SelectItem {
            item_id: item_id.to_string(),
            item_name: item_name.to_string(),
        })
        .await
    }

    pub async fn select_difficulty(&self, difficulty: u8) -> Result<(), LobbyError> {
        self.apply(LobbyOp::SelectDifficulty(difficulty)).await
    }

    pub async fn request_start(&self, modifiers: ActivityModifiers) -> Result<(), LobbyError> {
        self.apply(LobbyOp::RequestStart(modifiers)).await
    }

    pub async fn set_downloading(&self, downloading: bool) -> Result<(), LobbyError> {
        self.apply(LobbyOp::SetDownloading(downloading)).await
    }

    pub async fn mark_ready(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::MarkReady).await
    }

    pub async fn finish_activity(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::FinishActivity).await
    }

    pub async fn toggle_joinable(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::ToggleJoinable).await
    }

    pub async fn adjust_slot_count(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::AdjustSlotCount).await
    }

    pub async fn refresh_directory(&self, filter: SessionFilter) -> Result<(), LobbyError> {
        self.apply(LobbyOp::RefreshDirectory(filter)).await
    }

    pub async fn disconnect(&self) -> Result<(), LobbyError> {
        self.apply(LobbyOp::Disconnect).await
    }
}
