//! Local key-value persistence capability.
//!
//! One entry per entity collection, each an ordered JSON array keyed by a
//! fixed per-collection string, plus one key for the tombstone map. Pure
//! storage; no business logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::ids::EntityId;

/// Entity collections persisted in the local store and mirrored remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Clubs,
    Sessions,
    Participants,
    ParticipantSessions,
    Attendance,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Clubs,
        Collection::Sessions,
        Collection::Participants,
        Collection::ParticipantSessions,
        Collection::Attendance,
    ];

    /// Fixed local-store key for this collection.
    pub fn storage_key(self) -> &'static str {
        match self {
            Collection::Clubs => "clubs",
            Collection::Sessions => "sessions",
            Collection::Participants => "participants",
            Collection::ParticipantSessions => "participant_sessions",
            Collection::Attendance => "attendance_records",
        }
    }

    /// Remote table name. Matches the storage key for every collection.
    pub fn remote_table(self) -> &'static str {
        self.storage_key()
    }

    /// Fields that are local presentation state and must never be uploaded.
    pub fn local_only_fields(self) -> &'static [&'static str] {
        match self {
            Collection::Participants => &["session_ids"],
            _ => &[],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

/// Local-store key holding the tombstone map.
pub const TOMBSTONES_KEY: &str = "tombstones";

/// Errors raised by a [`LocalStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store I/O failure: {0}")]
    Io(String),

    #[error("corrupt local store entry '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Namespaced key -> JSON persistence capability.
///
/// Implementations must make each `set` atomic per key; callers never observe
/// a partially written entry.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`LocalStore`]. Used by tests and by callers that want a purely
/// ephemeral workspace.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Recorded deletions per collection.
///
/// Once an entity is deleted its id lands here, so a later download-and-merge
/// cannot reintroduce it from a remote copy that has not yet observed the
/// deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstones {
    #[serde(flatten)]
    by_collection: HashMap<String, HashSet<String>>,
}

impl Tombstones {
    pub async fn load(store: &dyn LocalStore) -> Result<Self> {
        match store.get(TOMBSTONES_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Tombstones::default()),
        }
    }

    pub async fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store
            .set(TOMBSTONES_KEY, serde_json::to_value(self)?)
            .await?;
        Ok(())
    }

    pub fn insert(&mut self, collection: Collection, id: &EntityId) {
        self.by_collection
            .entry(collection.storage_key().to_string())
            .or_default()
            .insert(id.as_str().to_string());
    }

    pub fn contains(&self, collection: Collection, id: &EntityId) -> bool {
        self.by_collection
            .get(collection.storage_key())
            .is_some_and(|ids| ids.contains(id.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_collection.values().all(HashSet::is_empty)
    }
}
