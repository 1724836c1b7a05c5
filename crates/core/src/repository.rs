//! Local-first entity repository.
//!
//! Every write lands in the local store immediately; the remote store is only
//! ever an opportunistic follow-up. Any network or auth failure degrades to
//! "operate on local data only" and is logged, never surfaced: the pending
//! write is picked up by the next sync pass.

use chrono::{NaiveDate, NaiveTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::SessionProvider;
use crate::errors::Result;
use crate::ids::EntityId;
use crate::merge::merge_records;
use crate::model::{
    upload_row, AttendanceRecord, Club, Participant, ParticipantSession, Session, SyncRecord,
};
use crate::remote::{Filter, RemoteStore};
use crate::store::{Collection, LocalStore, Tombstones};

/// Local-first CRUD per entity type.
#[derive(Clone)]
pub struct EntityRepository {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    sessions: Arc<dyn SessionProvider>,
}

impl EntityRepository {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            store,
            remote,
            sessions,
        }
    }

    // ---------------------------------------------------------------------
    // Collection plumbing
    // ---------------------------------------------------------------------

    pub(crate) async fn load_collection<T: SyncRecord>(&self) -> Result<Vec<T>> {
        match self.store.get(T::COLLECTION.storage_key()).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) async fn persist_collection<T: SyncRecord>(&self, rows: &[T]) -> Result<()> {
        self.store
            .set(T::COLLECTION.storage_key(), serde_json::to_value(rows)?)
            .await?;
        Ok(())
    }

    /// Insert-or-replace by id in the local store. Synchronous from the
    /// caller's point of view: returns once the store write is durable.
    async fn save_local<T: SyncRecord>(&self, record: &T) -> Result<()> {
        let mut rows = self.load_collection::<T>().await?;
        match rows.iter_mut().find(|row| row.id() == record.id()) {
            Some(slot) => *slot = record.clone(),
            None => rows.push(record.clone()),
        }
        self.persist_collection(&rows).await
    }

    /// Opportunistic remote upsert of a single record. On success a local id
    /// is promoted to the server-assigned one everywhere it is referenced; on
    /// any remote failure the local copy stays the record of truth.
    async fn try_upsert<T: SyncRecord>(&self, record: T) -> Result<T> {
        let Some(auth) = self.sessions.get_session().await else {
            return Ok(record);
        };
        let row = upload_row(&record)?;
        match self
            .remote
            .upsert(&auth.token, T::COLLECTION, vec![row])
            .await
        {
            Ok(returned) => {
                if record.id().is_local() {
                    let server_id = returned
                        .first()
                        .and_then(|row| row.get("id"))
                        .and_then(Value::as_str);
                    if let Some(server_id) = server_id {
                        let new_id = EntityId::remote(server_id);
                        self.promote_id(record.id(), &new_id).await?;
                        let mut promoted = record;
                        promoted.set_id(new_id);
                        return Ok(promoted);
                    }
                    warn!(
                        "{} upsert response carried no id; promotion deferred to next sync pass",
                        T::COLLECTION
                    );
                }
                Ok(record)
            }
            Err(err) => {
                debug!(
                    "{} upsert deferred to next sync pass ({:?}): {err}",
                    T::COLLECTION,
                    err.retry_class()
                );
                Ok(record)
            }
        }
    }

    /// Rewrite a promoted id in the record's own collection and in every
    /// collection that references it.
    pub(crate) async fn promote_id(&self, old: &EntityId, new: &EntityId) -> Result<()> {
        self.rewrite_collection::<Club>(old, new).await?;
        self.rewrite_collection::<Session>(old, new).await?;
        self.rewrite_collection::<Participant>(old, new).await?;
        self.rewrite_collection::<ParticipantSession>(old, new).await?;
        self.rewrite_collection::<AttendanceRecord>(old, new).await
    }

    async fn rewrite_collection<T: SyncRecord>(&self, old: &EntityId, new: &EntityId) -> Result<()> {
        let mut rows = self.load_collection::<T>().await?;
        let mut changed = false;
        for row in &mut rows {
            changed |= row.rewrite_id(old, new);
        }
        if changed {
            self.persist_collection(&rows).await?;
        }
        Ok(())
    }

    /// Local read plus, when a remote scope is resolvable, an opportunistic
    /// LWW refresh persisted back to the local store.
    async fn refresh<T: SyncRecord>(&self, filter: Option<Filter>) -> Result<Vec<T>> {
        let local = self.load_collection::<T>().await?;
        let Some(auth) = self.sessions.get_session().await else {
            return Ok(local);
        };
        let Some(filter) = filter else {
            return Ok(local);
        };

        match self.remote.select(&auth.token, T::COLLECTION, filter).await {
            Ok(rows) => {
                let mut remote = Vec::with_capacity(rows.len());
                for row in rows {
                    match serde_json::from_value::<T>(row) {
                        Ok(record) => remote.push(record),
                        Err(err) => {
                            warn!("discarding malformed {} row from remote: {err}", T::COLLECTION)
                        }
                    }
                }
                let tombstones = Tombstones::load(self.store.as_ref()).await?;
                let merged = merge_records(local, remote, &tombstones);
                self.persist_collection(&merged).await?;
                Ok(merged)
            }
            Err(err) => {
                debug!("{} refresh unavailable, serving local data: {err}", T::COLLECTION);
                Ok(local)
            }
        }
    }

    async fn tombstone_ids(&self, collection: Collection, ids: &[EntityId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tombstones = Tombstones::load(self.store.as_ref()).await?;
        for id in ids {
            tombstones.insert(collection, id);
        }
        tombstones.save(self.store.as_ref()).await
    }

    /// Remote delete by id, skipped silently when offline or when the record
    /// was never uploaded.
    async fn try_remote_delete(&self, collection: Collection, id: &EntityId) -> Result<()> {
        if id.is_local() {
            return Ok(());
        }
        let Some(auth) = self.sessions.get_session().await else {
            return Ok(());
        };
        let filter = Filter::Eq("id", id.as_str().to_string());
        if let Err(err) = self.remote.delete(&auth.token, collection, filter).await {
            debug!("{collection} remote delete deferred to next sync pass: {err}");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Clubs
    // ---------------------------------------------------------------------

    /// Create a club. `owner_id` is stamped from the current session when one
    /// exists; offline clubs stay unclaimed until their first upload.
    pub async fn create_club(&self, name: impl Into<String>) -> Result<Club> {
        let owner = self.sessions.get_session().await.map(|s| s.user_id);
        let club = Club::new(name, owner);
        self.save_local(&club).await?;
        self.try_upsert(club).await
    }

    pub async fn save_club(&self, mut club: Club) -> Result<Club> {
        club.updated_at = Utc::now();
        self.save_local(&club).await?;
        self.try_upsert(club).await
    }

    pub async fn list_clubs(&self) -> Result<Vec<Club>> {
        self.refresh::<Club>(Some(Filter::All)).await
    }

    pub async fn get_club(&self, id: &EntityId) -> Result<Option<Club>> {
        Ok(self
            .load_collection::<Club>()
            .await?
            .into_iter()
            .find(|club| &club.id == id))
    }

    /// Delete a club and cascade to everything it owns.
    ///
    /// The cloud-side delete is an ownership-gated policy branch, not an
    /// error path: a non-owner removes the club from local storage only.
    pub async fn delete_club(&self, id: &EntityId) -> Result<()> {
        let mut clubs = self.load_collection::<Club>().await?;
        let Some(position) = clubs.iter().position(|club| &club.id == id) else {
            return Ok(());
        };
        let club = clubs.remove(position);
        self.persist_collection(&clubs).await?;
        self.tombstone_ids(Collection::Clubs, std::slice::from_ref(id))
            .await?;

        // Cascade: sessions and participants of the club, then every join
        // and attendance record referencing one of them.
        let (_, removed_sessions) = self
            .remove_where::<Session>(|session| &session.club_id == id)
            .await?;
        let (_, removed_participants) = self
            .remove_where::<Participant>(|participant| &participant.club_id == id)
            .await?;
        self.cascade_dependents(&removed_sessions, &removed_participants)
            .await?;

        let auth = self.sessions.get_session().await;
        let is_owner = match (&club.owner_id, &auth) {
            (Some(owner), Some(auth)) => owner == &auth.user_id,
            (None, _) => true,
            (Some(_), None) => false,
        };
        if is_owner {
            self.try_remote_delete(Collection::Clubs, id).await?;
        } else {
            debug!("club {id} removed locally only: caller does not own it");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    pub async fn create_session(
        &self,
        club_id: EntityId,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Session> {
        let session = Session::new(club_id, day_of_week, start_time, end_time);
        self.save_local(&session).await?;
        self.try_upsert(session).await
    }

    pub async fn save_session(&self, mut session: Session) -> Result<Session> {
        session.updated_at = Utc::now();
        self.save_local(&session).await?;
        self.try_upsert(session).await
    }

    pub async fn list_sessions(&self, club_id: &EntityId) -> Result<Vec<Session>> {
        // A club the remote store has never seen cannot be used as a scope.
        let filter = (!club_id.is_local())
            .then(|| Filter::Eq("club_id", club_id.as_str().to_string()));
        let sessions = self.refresh::<Session>(filter).await?;
        Ok(sessions
            .into_iter()
            .filter(|session| &session.club_id == club_id)
            .collect())
    }

    pub async fn delete_session(&self, id: &EntityId) -> Result<()> {
        let (_, removed) = self.remove_where::<Session>(|session| &session.id == id).await?;
        if removed.is_empty() {
            return Ok(());
        }
        self.cascade_dependents(&removed, &[]).await?;
        self.try_remote_delete(Collection::Sessions, id).await
    }

    // ---------------------------------------------------------------------
    // Participants
    // ---------------------------------------------------------------------

    pub async fn create_participant(
        &self,
        club_id: EntityId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Result<Participant> {
        let participant = Participant::new(club_id, first_name, last_name);
        self.save_local(&participant).await?;
        self.try_upsert(participant).await
    }

    pub async fn save_participant(&self, mut participant: Participant) -> Result<Participant> {
        participant.updated_at = Utc::now();
        self.save_local(&participant).await?;
        self.try_upsert(participant).await
    }

    pub async fn list_participants(&self, club_id: &EntityId) -> Result<Vec<Participant>> {
        let filter = (!club_id.is_local())
            .then(|| Filter::Eq("club_id", club_id.as_str().to_string()));
        let participants = self.refresh::<Participant>(filter).await?;
        Ok(participants
            .into_iter()
            .filter(|participant| &participant.club_id == club_id)
            .collect())
    }

    pub async fn delete_participant(&self, id: &EntityId) -> Result<()> {
        let (_, removed) = self
            .remove_where::<Participant>(|participant| &participant.id == id)
            .await?;
        if removed.is_empty() {
            return Ok(());
        }
        self.cascade_dependents(&[], &removed).await?;
        self.try_remote_delete(Collection::Participants, id).await
    }

    // ---------------------------------------------------------------------
    // Join records
    // ---------------------------------------------------------------------

    /// Assign a participant to a session. Idempotent on the pair: an existing
    /// assignment is returned unchanged instead of duplicated.
    pub async fn add_participant_to_session(
        &self,
        participant_id: EntityId,
        session_id: EntityId,
    ) -> Result<ParticipantSession> {
        let links = self.load_collection::<ParticipantSession>().await?;
        if let Some(existing) = links.iter().find(|link| {
            link.participant_id == participant_id && link.session_id == session_id
        }) {
            return Ok(existing.clone());
        }
        let link = ParticipantSession::new(participant_id, session_id);
        self.save_local(&link).await?;
        self.try_upsert(link).await
    }

    pub async fn remove_participant_from_session(
        &self,
        participant_id: &EntityId,
        session_id: &EntityId,
    ) -> Result<()> {
        let (_, removed) = self
            .remove_where::<ParticipantSession>(|link| {
                &link.participant_id == participant_id && &link.session_id == session_id
            })
            .await?;
        for link in &removed {
            self.try_remote_delete(Collection::ParticipantSessions, &link.id)
                .await?;
        }
        Ok(())
    }

    /// Participants assigned to a session, assembled from local collections.
    pub async fn participants_for_session(&self, session_id: &EntityId) -> Result<Vec<Participant>> {
        let links = self.load_collection::<ParticipantSession>().await?;
        let wanted: HashSet<&str> = links
            .iter()
            .filter(|link| &link.session_id == session_id)
            .map(|link| link.participant_id.as_str())
            .collect();
        Ok(self
            .load_collection::<Participant>()
            .await?
            .into_iter()
            .filter(|participant| wanted.contains(participant.id.as_str()))
            .collect())
    }

    // ---------------------------------------------------------------------
    // Attendance
    // ---------------------------------------------------------------------

    /// Record attendance for one participant at one session on one date.
    /// Upserts on the (session, participant, date) triple: one conceptual
    /// record per occurrence.
    pub async fn record_attendance(
        &self,
        session_id: EntityId,
        participant_id: EntityId,
        date: NaiveDate,
        present: bool,
    ) -> Result<AttendanceRecord> {
        let records = self.load_collection::<AttendanceRecord>().await?;
        let record = match records.into_iter().find(|record| {
            record.session_id == session_id
                && record.participant_id == participant_id
                && record.date == date
        }) {
            Some(mut existing) => {
                existing.present = present;
                existing.updated_at = Some(Utc::now());
                existing
            }
            None => AttendanceRecord::new(session_id, participant_id, date, present),
        };
        self.save_local(&record).await?;
        self.try_upsert(record).await
    }

    pub async fn attendance_for(
        &self,
        session_id: &EntityId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>> {
        Ok(self
            .load_collection::<AttendanceRecord>()
            .await?
            .into_iter()
            .filter(|record| &record.session_id == session_id && record.date == date)
            .collect())
    }

    // ---------------------------------------------------------------------
    // Cascade helpers
    // ---------------------------------------------------------------------

    /// Remove matching records from a collection, tombstoning each removed
    /// id. Returns (kept, removed).
    async fn remove_where<T: SyncRecord>(
        &self,
        matches: impl Fn(&T) -> bool,
    ) -> Result<(Vec<T>, Vec<T>)> {
        let rows = self.load_collection::<T>().await?;
        let (removed, kept): (Vec<T>, Vec<T>) = rows.into_iter().partition(|row| matches(row));
        if !removed.is_empty() {
            self.persist_collection(&kept).await?;
            let ids: Vec<EntityId> = removed.iter().map(|row| row.id().clone()).collect();
            self.tombstone_ids(T::COLLECTION, &ids).await?;
        }
        Ok((kept, removed))
    }

    /// Remove join and attendance records referencing any of the given
    /// sessions or participants.
    async fn cascade_dependents(
        &self,
        sessions: &[Session],
        participants: &[Participant],
    ) -> Result<()> {
        let session_ids: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let participant_ids: HashSet<&str> =
            participants.iter().map(|p| p.id.as_str()).collect();

        self.remove_where::<ParticipantSession>(|link| {
            session_ids.contains(link.session_id.as_str())
                || participant_ids.contains(link.participant_id.as_str())
        })
        .await?;
        self.remove_where::<AttendanceRecord>(|record| {
            session_ids.contains(record.session_id.as_str())
                || participant_ids.contains(record.participant_id.as_str())
        })
        .await?;
        Ok(())
    }
}
