//! Sync pass error taxonomy and its handling policy table.

use thiserror::Error;

use crate::errors::Error;
use crate::remote::RemoteError;
use crate::store::{Collection, StoreError};

/// What the engine does with a given failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorPolicy {
    /// Abort the in-flight pass; the next trigger retries from scratch.
    RetryNextPass,
    /// Drop the offending record from the operation in progress and carry on.
    DropRecord,
    /// Local correctness is at stake; propagate to the caller.
    Surface,
}

/// Failures observed during a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store failure in any phase.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Locally persisted data failed to (de)serialize.
    #[error("serialization error during sync: {0}")]
    Serde(#[from] serde_json::Error),

    /// Remote call failed; the pass aborts at its current phase and earlier
    /// phases' writes stand (each phase commits only fully-formed data).
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A join record references an entity the remote store does not know.
    /// Never aborts a pass; the record is filtered from the upload batch.
    #[error("{collection} record {id} references an entity unknown to the remote store")]
    DanglingReference { collection: Collection, id: String },
}

impl SyncError {
    /// Policy table matching the error taxonomy: storage and serialization
    /// failures surface, remote failures retry on the next pass, dangling
    /// references drop the record.
    pub fn policy(&self) -> SyncErrorPolicy {
        match self {
            SyncError::Store(_) | SyncError::Serde(_) => SyncErrorPolicy::Surface,
            SyncError::Remote(_) => SyncErrorPolicy::RetryNextPass,
            SyncError::DanglingReference { .. } => SyncErrorPolicy::DropRecord,
        }
    }
}

impl From<Error> for SyncError {
    fn from(err: Error) -> Self {
        match err {
            Error::Store(inner) => SyncError::Store(inner),
            Error::Serde(inner) => SyncError::Serde(inner),
        }
    }
}
