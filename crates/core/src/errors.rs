//! Core error types.
//!
//! Local-storage and serialization failures are fatal to the current
//! operation and surface to the caller; remote failures carry their own type
//! ([`crate::remote::RemoteError`]) and are absorbed at the repository and
//! sync-engine boundaries.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by local-first operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store failure. Correctness of local-first writes depends on the
    /// store, so these are never swallowed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization failure for locally persisted data.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
