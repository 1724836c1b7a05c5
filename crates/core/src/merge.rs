//! Last-writer-wins merge policy.
//!
//! Pure functions over [`SyncRecord`]s, usable identically for every
//! collection: LWW resolution, union merge with tombstone suppression, join
//! record deduplication, and orphan filtering.

use std::collections::{HashMap, HashSet};

use crate::ids::EntityId;
use crate::model::{Participant, ParticipantSession, Session, SyncRecord};
use crate::store::Tombstones;

/// Pick the winner between a local and a remote copy of the same record.
///
/// Greater `updated_at` wins; on an exact tie the remote copy is treated as
/// authoritative.
pub fn resolve_lww<T: SyncRecord>(local: T, remote: T) -> T {
    if remote.updated_at() >= local.updated_at() {
        remote
    } else {
        local
    }
}

/// Union of local and remote records keyed by id.
///
/// Ids present on both sides resolve via [`resolve_lww`]; any id recorded in
/// the tombstone set for the record's collection is dropped. Local ordering
/// is preserved; remote-only records append in remote order.
pub fn merge_records<T: SyncRecord>(
    local: Vec<T>,
    remote: Vec<T>,
    tombstones: &Tombstones,
) -> Vec<T> {
    let mut remote_by_id: HashMap<String, T> = remote
        .into_iter()
        .map(|record| (record.id().as_str().to_string(), record))
        .collect();

    let mut merged = Vec::with_capacity(local.len() + remote_by_id.len());
    for record in local {
        if tombstones.contains(T::COLLECTION, record.id()) {
            continue;
        }
        match remote_by_id.remove(record.id().as_str()) {
            Some(remote_copy) => merged.push(resolve_lww(record, remote_copy)),
            None => merged.push(record),
        }
    }

    let mut remote_only: Vec<T> = remote_by_id.into_values().collect();
    remote_only.sort_by(|a, b| a.id().cmp(b.id()));
    for record in remote_only {
        if !tombstones.contains(T::COLLECTION, record.id()) {
            merged.push(record);
        }
    }
    merged
}

/// Collapse join records sharing the same (participant_id, session_id) pair,
/// keeping the copy with the latest `updated_at`.
pub fn dedup_links(links: Vec<ParticipantSession>) -> Vec<ParticipantSession> {
    let mut index: HashMap<(EntityId, EntityId), usize> = HashMap::new();
    let mut deduped: Vec<ParticipantSession> = Vec::with_capacity(links.len());

    for link in links {
        let key = (link.participant_id.clone(), link.session_id.clone());
        match index.get(&key) {
            Some(&slot) => {
                if SyncRecord::updated_at(&link) > SyncRecord::updated_at(&deduped[slot]) {
                    deduped[slot] = link;
                }
            }
            None => {
                index.insert(key, deduped.len());
                deduped.push(link);
            }
        }
    }
    deduped
}

/// Drop join records whose participant or session did not survive the merge
/// of its parent collection.
pub fn retain_resolvable_links(
    links: Vec<ParticipantSession>,
    sessions: &[Session],
    participants: &[Participant],
) -> Vec<ParticipantSession> {
    let session_ids: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
    let participant_ids: HashSet<&str> = participants.iter().map(|p| p.id.as_str()).collect();

    links
        .into_iter()
        .filter(|link| {
            session_ids.contains(link.session_id.as_str())
                && participant_ids.contains(link.participant_id.as_str())
        })
        .collect()
}
