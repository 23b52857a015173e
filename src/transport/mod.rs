//! Transport module
//!
//! Boundary to the external session-directory and messaging capability.

mod adapter;
mod backend;
mod error;
mod memory;
mod types;

pub use adapter::{AuthorityOracle, TransportAdapter};
pub use backend::DirectoryBackend;
pub use error::TransportError;
pub use memory::{MemoryBackend, MemoryDirectory};
pub use types::{
    PeerId, SessionFilter, SessionHandle, TransportEvent, Visibility, METADATA_KEY,
};
