//! Domain records and the record contract consumed by merge and sync.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EntityId;
use crate::store::Collection;

/// Uniform view of a synchronized record.
///
/// Gives the merge policy and the sync engine everything they need without
/// knowing the concrete entity: collection tag, id access, the last-writer
/// timestamp, and foreign-key rewriting for temporary-id promotion.
pub trait SyncRecord: Clone + Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn id(&self) -> &EntityId;
    fn set_id(&mut self, id: EntityId);
    fn updated_at(&self) -> DateTime<Utc>;

    /// Rewrite every reference to `old` (the record's own id included) to
    /// `new`. Returns true when anything changed.
    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool;
}

fn rewrite_field(field: &mut EntityId, old: &EntityId, new: &EntityId) -> bool {
    if field == old {
        *field = new.clone();
        true
    } else {
        false
    }
}

/// A club: the root of the entity graph.
///
/// `owner_id` absent means the club was created offline and is unclaimed; it
/// gets stamped with the authenticated identity at first upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Club {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub share_code: Option<String>,
    #[serde(default)]
    pub stats_reset_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Club {
    pub fn new(name: impl Into<String>, owner_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            name: name.into(),
            description: None,
            owner_id,
            share_code: None,
            stats_reset_date: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Club {
    const COLLECTION: Collection = Collection::Clubs;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool {
        rewrite_field(&mut self.id, old, new)
    }
}

/// A recurring training session belonging to exactly one club.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: EntityId,
    pub club_id: EntityId,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(club_id: EntityId, day_of_week: u8, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            club_id,
            day_of_week,
            start_time,
            end_time,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Session {
    const COLLECTION: Collection = Collection::Sessions;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = rewrite_field(&mut self.id, old, new);
        changed |= rewrite_field(&mut self.club_id, old, new);
        changed
    }
}

/// A club member.
///
/// `session_ids` is a local convenience projection of the join records and is
/// stripped before upload (see [`Collection::local_only_fields`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: EntityId,
    pub club_id: EntityId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub is_long_term_sick: bool,
    #[serde(default)]
    pub session_ids: Vec<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(club_id: EntityId, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            club_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            is_long_term_sick: false,
            session_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Participant {
    const COLLECTION: Collection = Collection::Participants;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = rewrite_field(&mut self.id, old, new);
        changed |= rewrite_field(&mut self.club_id, old, new);
        for session_id in &mut self.session_ids {
            changed |= rewrite_field(session_id, old, new);
        }
        changed
    }
}

/// Join record: one participant assigned to one session.
///
/// Logically unique on (participant_id, session_id); duplicates created on
/// two devices collapse at merge time, newest `updated_at` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSession {
    pub id: EntityId,
    pub participant_id: EntityId,
    pub session_id: EntityId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParticipantSession {
    pub fn new(participant_id: EntityId, session_id: EntityId) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            participant_id,
            session_id,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for ParticipantSession {
    const COLLECTION: Collection = Collection::ParticipantSessions;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = rewrite_field(&mut self.id, old, new);
        changed |= rewrite_field(&mut self.participant_id, old, new);
        changed |= rewrite_field(&mut self.session_id, old, new);
        changed
    }
}

/// Attendance of one participant at one session on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: EntityId,
    pub session_id: EntityId,
    pub participant_id: EntityId,
    pub date: NaiveDate,
    pub present: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    pub fn new(session_id: EntityId, participant_id: EntityId, date: NaiveDate, present: bool) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            session_id,
            participant_id,
            date,
            present,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

impl SyncRecord for AttendanceRecord {
    const COLLECTION: Collection = Collection::Attendance;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    /// Attendance rows may lack timestamps; fall back to `created_at`, then
    /// the epoch, so any timestamped copy beats an untimestamped one.
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
            .or(self.created_at)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    fn rewrite_id(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = rewrite_field(&mut self.id, old, new);
        changed |= rewrite_field(&mut self.session_id, old, new);
        changed |= rewrite_field(&mut self.participant_id, old, new);
        changed
    }
}

/// Serialize a record for upload.
///
/// Strips local-only presentation fields, and strips the id from rows that
/// still carry a temporary local identifier so the remote store issues the
/// permanent one.
pub(crate) fn upload_row<T: SyncRecord>(record: &T) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(record)?;
    if let Some(map) = value.as_object_mut() {
        if record.id().is_local() {
            map.remove("id");
        }
        for field in T::COLLECTION.local_only_fields() {
            map.remove(*field);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_records_carry_local_ids() {
        let club = Club::new("Judo Hamburg", Some("user-1".into()));
        assert!(club.id.is_local());
        assert_eq!(club.created_at, club.updated_at);
    }

    #[test]
    fn rewrite_id_touches_every_reference() {
        let club = Club::new("Judo", None);
        let old = club.id.clone();
        let new = EntityId::remote("club-42");

        let mut session = Session::new(
            old.clone(),
            0,
            NaiveTime::from_hms_opt(18, 0, 0).expect("time"),
            NaiveTime::from_hms_opt(19, 30, 0).expect("time"),
        );
        assert!(session.rewrite_id(&old, &new));
        assert_eq!(session.club_id, new);

        let mut participant = Participant::new(old.clone(), "Ada", "Lovelace");
        assert!(participant.rewrite_id(&old, &new));
        assert_eq!(participant.club_id, new);
    }

    #[test]
    fn upload_row_strips_local_id_and_presentation_fields() {
        let club_id = EntityId::remote("club-1");
        let mut participant = Participant::new(club_id, "Ada", "Lovelace");
        participant.session_ids.push(EntityId::remote("sess-1"));

        let row = upload_row(&participant).expect("serialize");
        assert!(row.get("id").is_none(), "local id must be stripped");
        assert!(row.get("session_ids").is_none(), "local-only field must be stripped");
        assert_eq!(row["first_name"], "Ada");

        participant.set_id(EntityId::remote("part-9"));
        let row = upload_row(&participant).expect("serialize");
        assert_eq!(row["id"], "part-9", "remote id must survive");
    }

    #[test]
    fn attendance_updated_at_falls_back() {
        let mut record = AttendanceRecord::new(
            EntityId::remote("s1"),
            EntityId::remote("p1"),
            NaiveDate::from_ymd_opt(2024, 3, 4).expect("date"),
            true,
        );
        record.updated_at = None;
        assert_eq!(SyncRecord::updated_at(&record), record.created_at.expect("created"));
        record.created_at = None;
        assert_eq!(SyncRecord::updated_at(&record), DateTime::UNIX_EPOCH);
    }
}
