//! In-process collaborators.
//!
//! Reference implementations of the synchronization service and the
//! transport that live entirely inside one process. They back the
//! simulation binary and the end-to-end tests.

mod network;
mod sync_service;

pub use network::{DEFAULT_BACKOFF_PERIOD, MemoryNetwork, MemoryTransport};
pub use sync_service::MemorySyncService;
