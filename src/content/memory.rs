//! In-process catalog used by the demo and tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{ContentError, ContentSource};

#[derive(Default)]
struct CatalogState {
    items: HashMap<String, String>,
    fetch_delay: Duration,
    index_time: Duration,
    stalled_fetches: u32,
    indexing_until: Option<Instant>,
    fetches: usize,
}

/// Catalog backed by a map of item id -> item name
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item_id: &str, name: &str) {
        self.state
            .lock()
            .items
            .insert(item_id.to_string(), name.to_string());
    }

    pub fn name_of(&self, item_id: &str) -> Option<String> {
        self.state.lock().items.get(item_id).cloned()
    }

    /// Simulated transfer time per fetch
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    /// How long the library reports loading after each fetch
    pub fn set_index_time(&self, time: Duration) {
        self.state.lock().index_time = time;
    }

    /// The next `count` fetches never complete
    pub fn stall_next_fetches(&self, count: u32) {
        self.state.lock().stalled_fetches = count;
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }
}

impl ContentSource for MemoryCatalog {
    fn fetch(&self, item_id: &str) -> impl Future<Output = Result<String, ContentError>> + Send {
        let state = self.state.clone();
        let item_id = item_id.to_string();
        async move {
            let (stalled, delay) = {
                let mut state = state.lock();
                state.fetches += 1;
                let stalled = state.stalled_fetches > 0;
                if stalled {
                    state.stalled_fetches -= 1;
                }
                (stalled, state.fetch_delay)
            };
            if stalled {
                debug!("Fetch of {} stalled", item_id);
                std::future::pending::<()>().await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = state.lock();
            if !state.items.contains_key(&item_id) {
                return Err(ContentError::NotFound(item_id));
            }
            state.indexing_until = Some(Instant::now() + state.index_time);
            Ok(item_id)
        }
    }

    fn is_loading(&self) -> bool {
        match self.state.lock().indexing_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}
