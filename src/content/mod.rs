//! Content acquisition
//!
//! Fetches the item the host selected from a catalog into the local library
//! and waits for the library to finish indexing it. The lobby only learns the
//! outcome: followers report `downloading` while this runs and `ready` once
//! it succeeds.

mod acquirer;
mod memory;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use acquirer::{AcquireError, AcquirerConfig, ContentAcquirer, READY_POLL_BUDGET};
pub use memory::MemoryCatalog;

/// Item ids are looked up by their first 32 characters
pub const ITEM_ID_LEN: usize = 32;

/// Content acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("Item not found in catalog: {0}")]
    NotFound(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// A remote catalog plus the local library items are unpacked into
pub trait ContentSource: Send + Sync {
    /// Download and unpack `item_id`. Resolves to the local key of the item.
    fn fetch(&self, item_id: &str) -> impl Future<Output = Result<String, ContentError>> + Send;

    /// Whether the local library is still indexing newly unpacked items
    fn is_loading(&self) -> bool;
}

/// Truncate an item id to its lookup form
pub fn normalize_item_id(item_id: &str) -> &str {
    match item_id.char_indices().nth(ITEM_ID_LEN) {
        Some((end, _)) => &item_id[..end],
        None => item_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_item_id() {
        let long = "0123456789abcdef0123456789abcdefEXTRA";
        assert_eq!(normalize_item_id(long), "0123456789abcdef0123456789abcdef");
        assert_eq!(normalize_item_id("short"), "short");
        assert_eq!(normalize_item_id(""), "");
    }
}
