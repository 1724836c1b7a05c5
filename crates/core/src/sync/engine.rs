//! The reconciliation engine.
//!
//! One pass runs `IDLE -> DOWNLOADING -> MERGING -> UPLOADING ->
//! RECONCILING_IDS -> IDLE`. Each phase commits only fully-formed data to the
//! local store, so a pass aborted by a remote failure leaves earlier phases'
//! writes in place and the next trigger retries from scratch. Re-running a
//! pass converges: upserts are idempotent, applied deletes are no-ops, and id
//! rewriting is a pure function of (local record, server id).

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::auth::{AuthSession, SessionProvider};
use crate::errors::Result as CoreResult;
use crate::ids::EntityId;
use crate::merge::{dedup_links, merge_records, retain_resolvable_links};
use crate::model::{
    upload_row, AttendanceRecord, Club, Participant, ParticipantSession, Session, SyncRecord,
};
use crate::remote::{Filter, RemoteStore};
use crate::repository::EntityRepository;
use crate::store::{Collection, LocalStore, Tombstones};

use super::error::SyncError;
use super::status::{
    load_checkpoint, save_checkpoint, RemoteIndex, SyncOutcome, SyncPhase, SyncSkip, SyncStatus,
};

/// All five entity collections held together, either as a remote snapshot or
/// as the merged local state.
#[derive(Debug, Default)]
struct Collections {
    clubs: Vec<Club>,
    sessions: Vec<Session>,
    participants: Vec<Participant>,
    links: Vec<ParticipantSession>,
    attendance: Vec<AttendanceRecord>,
}

impl Collections {
    fn row_count(&self) -> usize {
        self.clubs.len()
            + self.sessions.len()
            + self.participants.len()
            + self.links.len()
            + self.attendance.len()
    }

    /// Apply promoted ids to every record in memory so dependent upload
    /// batches carry server ids instead of temporary ones.
    fn apply_id_map(&mut self, id_map: &[(EntityId, EntityId)]) {
        for (old, new) in id_map {
            for row in &mut self.clubs {
                row.rewrite_id(old, new);
            }
            for row in &mut self.sessions {
                row.rewrite_id(old, new);
            }
            for row in &mut self.participants {
                row.rewrite_id(old, new);
            }
            for row in &mut self.links {
                row.rewrite_id(old, new);
            }
            for row in &mut self.attendance {
                row.rewrite_id(old, new);
            }
        }
    }
}

fn id_set<T: SyncRecord>(rows: &[T]) -> HashSet<String> {
    rows.iter().map(|row| row.id().as_str().to_string()).collect()
}

/// Downloaded ids grouped by club ownership. A remote delete is issued only
/// for rows whose club belongs to the caller; everything else stays a local
/// removal and the owning device retires it.
#[derive(Debug, Default)]
struct DeleteScope {
    clubs: HashSet<String>,
    sessions: HashSet<String>,
    participants: HashSet<String>,
    links: HashSet<String>,
    attendance: HashSet<String>,
}

impl DeleteScope {
    fn from_snapshot(snapshot: &Collections, user_id: &str) -> Self {
        let clubs: HashSet<String> = snapshot
            .clubs
            .iter()
            .filter(|club| club.owner_id.as_deref() == Some(user_id))
            .map(|club| club.id.as_str().to_string())
            .collect();
        let sessions: HashSet<String> = snapshot
            .sessions
            .iter()
            .filter(|session| clubs.contains(session.club_id.as_str()))
            .map(|session| session.id.as_str().to_string())
            .collect();
        let participants: HashSet<String> = snapshot
            .participants
            .iter()
            .filter(|participant| clubs.contains(participant.club_id.as_str()))
            .map(|participant| participant.id.as_str().to_string())
            .collect();
        // Links are keyed through their participant and attendance through its
        // session, so orphans in an owned club remain reachable for cleanup.
        let links: HashSet<String> = snapshot
            .links
            .iter()
            .filter(|link| participants.contains(link.participant_id.as_str()))
            .map(|link| link.id.as_str().to_string())
            .collect();
        let attendance: HashSet<String> = snapshot
            .attendance
            .iter()
            .filter(|record| sessions.contains(record.session_id.as_str()))
            .map(|record| record.id.as_str().to_string())
            .collect();
        Self {
            clubs,
            sessions,
            participants,
            links,
            attendance,
        }
    }
}

fn is_pending<T: SyncRecord>(record: &T, checkpoint: Option<DateTime<Utc>>) -> bool {
    record.id().is_local() || checkpoint.is_none_or(|cp| record.updated_at() > cp)
}

/// Singleton coordinator for full reconciliation passes.
///
/// Owns the in-process pass lock, the last-checkpoint timestamp, and shared
/// handles to the local store and remote client. Construct once and hand out
/// by `Arc` to whatever triggers sync (timer, foreground hook, user action).
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    sessions: Arc<dyn SessionProvider>,
    repo: EntityRepository,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        let repo = EntityRepository::new(store.clone(), remote.clone(), sessions.clone());
        Self {
            store,
            remote,
            sessions,
            repo,
            in_flight: AtomicBool::new(false),
        }
    }

    /// The repository sharing this engine's store and remote handles.
    pub fn repository(&self) -> &EntityRepository {
        &self.repo
    }

    /// Persisted engine status (timestamps, failure streak, last outcome).
    pub async fn status(&self) -> CoreResult<SyncStatus> {
        SyncStatus::load(self.store.as_ref()).await
    }

    /// Run one full reconciliation pass.
    ///
    /// Re-entrant-safe: a pass requested while one is in flight returns a
    /// skipped outcome immediately; the newest local state is picked up by
    /// the next invocation, so work is deferred, never lost.
    pub async fn sync_pass(&self) -> Result<SyncOutcome, SyncError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("sync pass already in flight; trigger ignored");
            return Ok(SyncOutcome::skipped(SyncSkip::PassInFlight));
        }

        let started = Utc::now();
        let result = self.run_pass(started).await;
        self.in_flight.store(false, Ordering::SeqCst);
        self.record_outcome(started, &result).await;
        result
    }

    async fn run_pass(&self, started: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let Some(auth) = self.sessions.get_session().await else {
            debug!("no authenticated session; sync pass skipped");
            return Ok(SyncOutcome::skipped(SyncSkip::NoSession));
        };
        let checkpoint = load_checkpoint(self.store.as_ref()).await?;

        debug!("sync phase: {:?}", SyncPhase::Downloading);
        let (snapshot, index) = self.download(&auth).await?;
        let pulled = snapshot.row_count();
        let scope = DeleteScope::from_snapshot(&snapshot, &auth.user_id);

        debug!("sync phase: {:?}", SyncPhase::Merging);
        let mut state = self.merge(snapshot).await?;

        debug!("sync phase: {:?}", SyncPhase::Uploading);
        let mut id_map: Vec<(EntityId, EntityId)> = Vec::new();
        let mut uploaded = RemoteIndex::default();
        let (pushed, dropped) = self
            .upload(&auth, checkpoint, &index, &mut state, &mut id_map, &mut uploaded)
            .await?;
        let deleted_remote = self.push_deletes(&auth, &index, &state, &scope).await?;

        debug!("sync phase: {:?}", SyncPhase::ReconcilingIds);
        for (old, new) in &id_map {
            self.repo.promote_id(old, new).await?;
        }
        save_checkpoint(self.store.as_ref(), started).await?;

        let outcome = SyncOutcome {
            skipped: None,
            pulled,
            pushed,
            deleted_remote,
            dropped,
            promoted_ids: id_map.len(),
            duration_ms: (Utc::now() - started).num_milliseconds(),
        };
        debug!(
            "sync pass complete: pulled={} pushed={} deleted_remote={} dropped={} promoted={}",
            outcome.pulled, outcome.pushed, outcome.deleted_remote, outcome.dropped,
            outcome.promoted_ids
        );
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Phase: download
    // ---------------------------------------------------------------------

    async fn fetch<T: SyncRecord>(
        &self,
        token: &str,
        filter: Filter,
    ) -> Result<Vec<T>, SyncError> {
        let rows = self.remote.select(token, T::COLLECTION, filter).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<T>(row) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!("discarding malformed {} row from remote: {err}", T::COLLECTION)
                }
            }
        }
        Ok(records)
    }

    async fn fetch_scoped<T: SyncRecord>(
        &self,
        token: &str,
        column: &'static str,
        ids: &[String],
    ) -> Result<Vec<T>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(token, Filter::AnyOf(column, ids.to_vec())).await
    }

    /// Fetch the remote state visible to the caller: clubs first, then their
    /// sessions and participants (independent, fetched concurrently), then
    /// the join and attendance rows scoped to those.
    async fn download(
        &self,
        auth: &AuthSession,
    ) -> Result<(Collections, RemoteIndex), SyncError> {
        let clubs = self.fetch::<Club>(&auth.token, Filter::All).await?;
        let club_ids: Vec<String> = clubs.iter().map(|c| c.id.as_str().to_string()).collect();

        let (sessions, participants) = futures::try_join!(
            self.fetch_scoped::<Session>(&auth.token, "club_id", &club_ids),
            self.fetch_scoped::<Participant>(&auth.token, "club_id", &club_ids),
        )?;
        let session_ids: Vec<String> =
            sessions.iter().map(|s| s.id.as_str().to_string()).collect();
        let participant_ids: Vec<String> =
            participants.iter().map(|p| p.id.as_str().to_string()).collect();

        let (links, attendance) = futures::try_join!(
            self.fetch_scoped::<ParticipantSession>(&auth.token, "participant_id", &participant_ids),
            self.fetch_scoped::<AttendanceRecord>(&auth.token, "session_id", &session_ids),
        )?;

        let mut index = RemoteIndex::default();
        for id in &club_ids {
            index.insert(Collection::Clubs, id.clone());
        }
        for id in &session_ids {
            index.insert(Collection::Sessions, id.clone());
        }
        for id in &participant_ids {
            index.insert(Collection::Participants, id.clone());
        }
        for link in &links {
            index.insert(Collection::ParticipantSessions, link.id.as_str());
        }
        for record in &attendance {
            index.insert(Collection::Attendance, record.id.as_str());
        }

        let snapshot = Collections {
            clubs,
            sessions,
            participants,
            links,
            attendance,
        };
        Ok((snapshot, index))
    }

    // ---------------------------------------------------------------------
    // Phase: merge
    // ---------------------------------------------------------------------

    /// Merge remote and local state per collection and persist the result.
    /// Each collection is written back as one fully-formed unit.
    async fn merge(&self, remote: Collections) -> Result<Collections, SyncError> {
        let tombstones = Tombstones::load(self.store.as_ref()).await?;

        let clubs = merge_records(
            self.repo.load_collection::<Club>().await?,
            remote.clubs,
            &tombstones,
        );
        let sessions = merge_records(
            self.repo.load_collection::<Session>().await?,
            remote.sessions,
            &tombstones,
        );
        let participants = merge_records(
            self.repo.load_collection::<Participant>().await?,
            remote.participants,
            &tombstones,
        );
        let links = merge_records(
            self.repo.load_collection::<ParticipantSession>().await?,
            remote.links,
            &tombstones,
        );
        let links = dedup_links(links);
        let links = retain_resolvable_links(links, &sessions, &participants);
        let attendance = merge_records(
            self.repo.load_collection::<AttendanceRecord>().await?,
            remote.attendance,
            &tombstones,
        );

        self.repo.persist_collection(&clubs).await?;
        self.repo.persist_collection(&sessions).await?;
        self.repo.persist_collection(&participants).await?;
        self.repo.persist_collection(&links).await?;
        self.repo.persist_collection(&attendance).await?;

        Ok(Collections {
            clubs,
            sessions,
            participants,
            links,
            attendance,
        })
    }

    // ---------------------------------------------------------------------
    // Phase: upload
    // ---------------------------------------------------------------------

    /// Upsert one batch per collection. Returns the number of rows pushed and
    /// records id promotions and uploaded ids for later phases.
    async fn upsert_batch<T: SyncRecord>(
        &self,
        auth: &AuthSession,
        batch: &[T],
        id_map: &mut Vec<(EntityId, EntityId)>,
        uploaded: &mut RemoteIndex,
    ) -> Result<usize, SyncError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rows: Vec<Value> = batch
            .iter()
            .map(upload_row)
            .collect::<Result<_, serde_json::Error>>()?;
        let returned = self
            .remote
            .upsert(&auth.token, T::COLLECTION, rows)
            .await?;
        if returned.len() != batch.len() {
            warn!(
                "{} upsert returned {} rows for {} sent; id promotion deferred where unmatched",
                T::COLLECTION,
                returned.len(),
                batch.len()
            );
        }
        for (sent, received) in batch.iter().zip(returned.iter()) {
            match received.get("id").and_then(Value::as_str) {
                Some(server_id) => {
                    uploaded.insert(T::COLLECTION, server_id);
                    if sent.id().is_local() {
                        id_map.push((sent.id().clone(), EntityId::remote(server_id)));
                    }
                }
                None => {
                    if !sent.id().is_local() {
                        uploaded.insert(T::COLLECTION, sent.id().as_str());
                    }
                }
            }
        }
        Ok(batch.len())
    }

    async fn upload_pending<T: SyncRecord>(
        &self,
        auth: &AuthSession,
        checkpoint: Option<DateTime<Utc>>,
        rows: &[T],
        id_map: &mut Vec<(EntityId, EntityId)>,
        uploaded: &mut RemoteIndex,
    ) -> Result<usize, SyncError> {
        let batch: Vec<T> = rows
            .iter()
            .filter(|row| is_pending(*row, checkpoint))
            .cloned()
            .collect();
        self.upsert_batch(auth, &batch, id_map, uploaded).await
    }

    /// True when the reference both carries a server id and is known to exist
    /// remotely: observed during download or uploaded earlier in this pass.
    fn resolves_remotely(
        id: &EntityId,
        collection: Collection,
        index: &RemoteIndex,
        uploaded: &RemoteIndex,
    ) -> bool {
        !id.is_local()
            && (index.contains(collection, id.as_str())
                || uploaded.contains(collection, id.as_str()))
    }

    /// Upload pending mutations, parents before children, one batched upsert
    /// per collection. Returns (pushed, dropped).
    async fn upload(
        &self,
        auth: &AuthSession,
        checkpoint: Option<DateTime<Utc>>,
        index: &RemoteIndex,
        state: &mut Collections,
        id_map: &mut Vec<(EntityId, EntityId)>,
        uploaded: &mut RemoteIndex,
    ) -> Result<(usize, usize), SyncError> {
        let mut pushed = 0usize;
        let mut dropped = 0usize;

        // Claim offline-created clubs at their first authenticated upload.
        let mut stamped = false;
        for club in &mut state.clubs {
            if club.owner_id.is_none() {
                club.owner_id = Some(auth.user_id.clone());
                club.updated_at = Utc::now();
                stamped = true;
            }
        }
        if stamped {
            self.repo.persist_collection(&state.clubs).await?;
        }

        pushed += self
            .upload_pending(auth, checkpoint, &state.clubs, id_map, uploaded)
            .await?;
        state.apply_id_map(id_map);

        pushed += self
            .upload_pending(auth, checkpoint, &state.sessions, id_map, uploaded)
            .await?;
        pushed += self
            .upload_pending(auth, checkpoint, &state.participants, id_map, uploaded)
            .await?;
        state.apply_id_map(id_map);

        // Referential-integrity filter: a join row is upload-eligible only if
        // both of its parents exist in the remote store. Ineligible rows are
        // dropped from the batch, not deleted locally, and not fatal.
        let mut link_batch: Vec<ParticipantSession> = Vec::new();
        for link in state.links.iter().filter(|link| is_pending(*link, checkpoint)) {
            let eligible = Self::resolves_remotely(
                &link.participant_id,
                Collection::Participants,
                index,
                uploaded,
            ) && Self::resolves_remotely(
                &link.session_id,
                Collection::Sessions,
                index,
                uploaded,
            );
            if eligible {
                link_batch.push(link.clone());
            } else {
                let err = SyncError::DanglingReference {
                    collection: Collection::ParticipantSessions,
                    id: link.id.as_str().to_string(),
                };
                debug!("{err}; dropped from upload batch ({:?})", err.policy());
                dropped += 1;
            }
        }
        pushed += self.upsert_batch(auth, &link_batch, id_map, uploaded).await?;

        let attendance_batch: Vec<AttendanceRecord> = state
            .attendance
            .iter()
            .filter(|record| is_pending(*record, checkpoint))
            .filter(|record| {
                let eligible = !record.session_id.is_local() && !record.participant_id.is_local();
                if !eligible {
                    debug!(
                        "attendance record {} still references a temporary id; deferred",
                        record.id
                    );
                }
                eligible
            })
            .cloned()
            .collect();
        pushed += self
            .upsert_batch(auth, &attendance_batch, id_map, uploaded)
            .await?;
        state.apply_id_map(id_map);

        Ok((pushed, dropped))
    }

    // ---------------------------------------------------------------------
    // Phase: remote deletes
    // ---------------------------------------------------------------------

    async fn delete_stale(
        &self,
        auth: &AuthSession,
        collection: Collection,
        index: &RemoteIndex,
        local_ids: &HashSet<String>,
        owned: &HashSet<String>,
    ) -> Result<usize, SyncError> {
        let stale: Vec<String> = index
            .ids(collection)
            .into_iter()
            .filter(|id| !local_ids.contains(id))
            .filter(|id| {
                let allowed = owned.contains(id);
                if !allowed {
                    debug!(
                        "{collection} row {id} removed locally only: caller does not own its club"
                    );
                }
                allowed
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        self.remote
            .delete(&auth.token, collection, Filter::AnyOf("id", stale.clone()))
            .await?;
        Ok(stale.len())
    }

    /// Ids present remotely but absent from the merged local state become
    /// remote deletes, children first. Every collection is gated on club
    /// ownership: rows of a club the caller does not own are never deleted
    /// remotely, so a non-owner's local cascade cannot destroy shared data.
    async fn push_deletes(
        &self,
        auth: &AuthSession,
        index: &RemoteIndex,
        state: &Collections,
        scope: &DeleteScope,
    ) -> Result<usize, SyncError> {
        let mut deleted = 0usize;
        deleted += self
            .delete_stale(
                auth,
                Collection::Attendance,
                index,
                &id_set(&state.attendance),
                &scope.attendance,
            )
            .await?;
        deleted += self
            .delete_stale(
                auth,
                Collection::ParticipantSessions,
                index,
                &id_set(&state.links),
                &scope.links,
            )
            .await?;
        deleted += self
            .delete_stale(
                auth,
                Collection::Sessions,
                index,
                &id_set(&state.sessions),
                &scope.sessions,
            )
            .await?;
        deleted += self
            .delete_stale(
                auth,
                Collection::Participants,
                index,
                &id_set(&state.participants),
                &scope.participants,
            )
            .await?;
        deleted += self
            .delete_stale(auth, Collection::Clubs, index, &id_set(&state.clubs), &scope.clubs)
            .await?;
        Ok(deleted)
    }

    // ---------------------------------------------------------------------
    // Bookkeeping
    // ---------------------------------------------------------------------

    /// Best-effort status write after a pass; a failure here is logged and
    /// never clobbers the pass result.
    async fn record_outcome(
        &self,
        started: DateTime<Utc>,
        result: &Result<SyncOutcome, SyncError>,
    ) {
        let mut status = match SyncStatus::load(self.store.as_ref()).await {
            Ok(status) => status,
            Err(err) => {
                warn!("failed to load sync status: {err}");
                return;
            }
        };
        status.last_attempt_at = Some(started);
        match result {
            Ok(outcome) => {
                if outcome.ran() {
                    status.last_success_at = Some(Utc::now());
                    status.last_error = None;
                    status.consecutive_failures = 0;
                    status.last_outcome = Some(outcome.clone());
                }
            }
            Err(err) => {
                status.last_error = Some(err.to_string());
                status.consecutive_failures += 1;
            }
        }
        if let Err(err) = status.save(self.store.as_ref()).await {
            warn!("failed to persist sync status: {err}");
        }
    }
}
