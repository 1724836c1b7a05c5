//! Sync-engine bookkeeping: persisted status and checkpoint, per-pass
//! remote id index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::errors::Result;
use crate::store::{Collection, LocalStore};

/// Local-store key for the engine status record.
pub const SYNC_STATUS_KEY: &str = "sync_status";
/// Local-store key for the last successful sync checkpoint.
pub const SYNC_CHECKPOINT_KEY: &str = "sync_checkpoint";

/// Phases of one reconciliation pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Downloading,
    Merging,
    Uploading,
    ReconcilingIds,
}

/// Why a requested pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSkip {
    /// Another pass holds the in-process lock; work is deferred, not lost.
    PassInFlight,
    /// No authenticated session; there is nothing to talk to the remote with.
    NoSession,
}

/// Cycle metrics for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub skipped: Option<SyncSkip>,
    /// Remote rows downloaded.
    pub pulled: usize,
    /// Local rows uploaded.
    pub pushed: usize,
    /// Remote rows deleted by the diff step.
    pub deleted_remote: usize,
    /// Records dropped by the referential-integrity filter.
    pub dropped: usize,
    /// Temporary ids promoted to server ids.
    pub promoted_ids: usize,
    pub duration_ms: i64,
}

impl SyncOutcome {
    pub fn skipped(reason: SyncSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// True when the pass actually reconciled (was not skipped).
    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Lightweight engine status persisted across passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub last_outcome: Option<SyncOutcome>,
}

impl SyncStatus {
    pub async fn load(store: &dyn LocalStore) -> Result<Self> {
        match store.get(SYNC_STATUS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(SyncStatus::default()),
        }
    }

    pub async fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store
            .set(SYNC_STATUS_KEY, serde_json::to_value(self)?)
            .await?;
        Ok(())
    }
}

pub(crate) async fn load_checkpoint(store: &dyn LocalStore) -> Result<Option<DateTime<Utc>>> {
    match store.get(SYNC_CHECKPOINT_KEY).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(None),
    }
}

pub(crate) async fn save_checkpoint(
    store: &dyn LocalStore,
    checkpoint: DateTime<Utc>,
) -> Result<()> {
    store
        .set(SYNC_CHECKPOINT_KEY, serde_json::to_value(checkpoint)?)
        .await?;
    Ok(())
}

/// Ids observed in the remote store during one pass, per collection.
///
/// Built fresh from each download and discarded with the pass. Feeds the
/// delete diff (ids present remotely but absent locally become remote
/// deletes) and the referential-integrity upload filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIndex {
    by_collection: HashMap<String, HashSet<String>>,
}

impl RemoteIndex {
    pub fn insert(&mut self, collection: Collection, id: impl Into<String>) {
        self.by_collection
            .entry(collection.storage_key().to_string())
            .or_default()
            .insert(id.into());
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.by_collection
            .get(collection.storage_key())
            .is_some_and(|ids| ids.contains(id))
    }

    pub fn ids(&self, collection: Collection) -> HashSet<String> {
        self.by_collection
            .get(collection.storage_key())
            .cloned()
            .unwrap_or_default()
    }
}
