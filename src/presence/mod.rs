pub mod announcement;
pub mod query;
pub mod reducer;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{RoomId, UserId, identity::Identity};

pub use announcement::{Activity, Announcement, build_announcement};
pub use reducer::{apply_snapshot, apply_typing};

#[derive(thiserror::Error, Debug)]
pub enum PresenceError {
    #[error("Malformed announcement: {0}")]
    MalformedAnnouncement(String),
    #[error("Malformed typing event: {0}")]
    MalformedTypingEvent(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Offline,
}

/// Canonical, locally reduced view of one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub identity: Identity,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub active_rooms: BTreeSet<RoomId>,
    pub is_typing: bool,
}

impl PresenceRecord {
    pub fn user_id(&self) -> &UserId {
        &self.identity.id
    }

    pub fn is_in_room(&self, room_id: &str) -> bool {
        self.active_rooms.contains(room_id)
    }
}

/// Ephemeral typing notification, never part of the presence table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TypingEvent {
    pub user_id: UserId,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    pub is_typing: bool,
}

/// `user_id -> PresenceRecord`, rebuilt on every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PresenceState(BTreeMap<UserId, PresenceRecord>);

impl PresenceState {
    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.0.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.0.values()
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.0.keys()
    }

    fn get_mut(&mut self, user_id: &str) -> Option<&mut PresenceRecord> {
        self.0.get_mut(user_id)
    }

    fn insert(&mut self, record: PresenceRecord) {
        self.0.insert(record.identity.id.clone(), record);
    }
}

impl FromIterator<PresenceRecord> for PresenceState {
    fn from_iter<T: IntoIterator<Item = PresenceRecord>>(iter: T) -> Self {
        let mut state = PresenceState::default();
        for record in iter {
            state.insert(record);
        }
        state
    }
}
