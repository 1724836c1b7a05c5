//! Offline-first synchronization engine.

mod engine;
mod error;
mod scheduler;
mod status;

pub use engine::SyncEngine;
pub use error::{SyncError, SyncErrorPolicy};
pub use scheduler::{backoff_seconds, run_periodic, SYNC_FOREGROUND_INTERVAL_SECS};
pub use status::{RemoteIndex, SyncOutcome, SyncPhase, SyncSkip, SyncStatus};
