//! Offline-first club roster domain and sync engine.
//!
//! Every read and write goes through [`EntityRepository`] against the local
//! store first; the device stays fully usable with no session and no network.
//! [`sync::SyncEngine`] reconciles the local store with the remote backend in
//! explicit passes using last-write-wins timestamps, temporary-id promotion,
//! and tombstone-driven deletes.

pub mod auth;
pub mod errors;
pub mod ids;
pub mod merge;
pub mod model;
pub mod remote;
pub mod repository;
pub mod store;
pub mod sync;

pub use auth::{AuthSession, SessionProvider, StaticSessionProvider};
pub use errors::{Error, Result};
pub use ids::EntityId;
pub use model::{AttendanceRecord, Club, Participant, ParticipantSession, Session, SyncRecord};
pub use remote::{Filter, RemoteError, RemoteRetryClass, RemoteStore};
pub use repository::EntityRepository;
pub use store::{Collection, LocalStore, MemoryStore, StoreError, Tombstones};
pub use sync::{SyncEngine, SyncError, SyncErrorPolicy, SyncOutcome, SyncStatus};
