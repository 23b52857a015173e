//! Download driver with retry-on-timeout and a bounded readiness wait

use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{normalize_item_id, ContentError, ContentSource};
use crate::lobby::{LobbyError, LobbyHandle};

/// How long the library may keep indexing after a download
pub const READY_POLL_BUDGET: Duration = Duration::from_secs(5);

/// Acquisition tuning
#[derive(Debug, Clone)]
pub struct AcquirerConfig {
    /// Download attempts before giving up on timeouts
    pub attempts: u32,
    /// Per-attempt download timeout
    pub attempt_timeout: Duration,
    /// Readiness wait budget after a successful download
    pub ready_budget: Duration,
    pub poll_interval: Duration,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            ready_budget: READY_POLL_BUDGET,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Drives a [`ContentSource`]
pub struct ContentAcquirer<S> {
    source: S,
    config: AcquirerConfig,
}

impl<S: ContentSource> ContentAcquirer<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, AcquirerConfig::default())
    }

    pub fn with_config(source: S, config: AcquirerConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch `item_id` and wait for the library to index it.
    ///
    /// Timed-out attempts are retried; any other failure is returned at once.
    pub async fn acquire(&self, item_id: &str) -> Result<String, ContentError> {
        let item_id = normalize_item_id(item_id);
        info!("Starting download for {}", item_id);

        for attempt in 1..=self.config.attempts {
            match timeout(self.config.attempt_timeout, self.source.fetch(item_id)).await {
                Ok(Ok(key)) => {
                    self.wait_until_indexed().await?;
                    info!("Downloaded {} as {}", item_id, key);
                    return Ok(key);
                }
                Ok(Err(e)) => {
                    warn!("Download of {} failed: {}", item_id, e);
                    return Err(e);
                }
                Err(_) => warn!(
                    "Download of {} timed out (attempt {}/{})",
                    item_id, attempt, self.config.attempts
                ),
            }
        }
        Err(ContentError::Timeout(self.config.attempt_timeout))
    }

    async fn wait_until_indexed(&self) -> Result<(), ContentError> {
        let deadline = Instant::now() + self.config.ready_budget;
        while self.source.is_loading() {
            if Instant::now() >= deadline {
                warn!("Library still loading after {:?}", self.config.ready_budget);
                return Err(ContentError::Timeout(self.config.ready_budget));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(())
    }

    /// Acquire `item_id` on behalf of a lobby member: report downloading,
    /// fetch, then report ready. On failure the downloading flag is cleared
    /// and the member stays not-ready.
    pub async fn acquire_for(
        &self,
        lobby: &LobbyHandle,
        item_id: &str,
    ) -> Result<String, AcquireError> {
        lobby.set_downloading(true).await?;
        match self.acquire(item_id).await {
            Ok(key) => {
                lobby.mark_ready().await?;
                Ok(key)
            }
            Err(e) => {
                debug!("Clearing downloading flag after failure");
                lobby.set_downloading(false).await?;
                Err(e.into())
            }
        }
    }
}

/// Failure of [`ContentAcquirer::acquire_for`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),
}
