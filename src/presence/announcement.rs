use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;
use ts_rs::TS;

use super::{PresenceError, PresenceRecord, PresenceStatus};
use crate::{RoomId, UserId, identity::Identity};

/// What a foregrounded or backgrounded session announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Online,
    Away,
}

/// One raw row of the presence table, as published by a session.
///
/// Rows come from other clients, possibly running other versions, so only
/// `user_id` is required when reading; everything else falls back to a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Announcement {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub active_rooms: Vec<RoomId>,
    #[serde(default)]
    pub is_typing: bool,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn field<T: DeserializeOwned>(fields: &Map<String, Value>, name: &str) -> Option<T> {
    let value = fields.get(name).filter(|value| !value.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(field = %name, error = %e, "Ignoring unreadable announcement field");
            None
        }
    }
}

/// Builds the complete announcement for the given activity.
///
/// Away sessions clear their room membership and typing flag.
pub fn build_announcement(
    identity: &Identity,
    activity: Activity,
    room_id: Option<&RoomId>,
    is_typing: bool,
    now: DateTime<Utc>,
) -> Announcement {
    let (status, active_rooms, is_typing) = match activity {
        Activity::Online => (
            PresenceStatus::Online,
            room_id.into_iter().cloned().collect(),
            is_typing,
        ),
        Activity::Away => (PresenceStatus::Away, Vec::new(), false),
    };

    Announcement {
        user_id: identity.id.clone(),
        email: identity.email.clone(),
        name: identity.name.clone(),
        avatar_url: identity.avatar_url.clone(),
        status,
        last_seen: now,
        active_rooms,
        is_typing,
    }
}

impl Announcement {
    /// Parses one raw table entry.
    ///
    /// Only a non-empty string `user_id` is required. Any other field that is
    /// missing, `null` or unreadable (a status from a newer client, say) falls
    /// back to its default instead of dropping the row. Unknown fields, such as
    /// the provider's `presence_ref`, are ignored.
    pub fn parse(raw: &Value) -> Result<Self, PresenceError> {
        let fields = raw.as_object().ok_or_else(|| {
            PresenceError::MalformedAnnouncement("entry is not an object".to_string())
        })?;
        let user_id = fields
            .get("user_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                PresenceError::MalformedAnnouncement("missing or empty user_id".to_string())
            })?;

        Ok(Self {
            user_id: user_id.to_string(),
            email: field(fields, "email"),
            name: field(fields, "name"),
            avatar_url: field(fields, "avatar_url"),
            status: field(fields, "status").unwrap_or_default(),
            last_seen: field(fields, "last_seen").unwrap_or_else(unix_epoch),
            active_rooms: field(fields, "active_rooms").unwrap_or_default(),
            is_typing: field(fields, "is_typing").unwrap_or_default(),
        })
    }

    pub fn to_value(&self) -> Value {
        // A struct of strings, bools and timestamps always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Announcement> for PresenceRecord {
    fn from(announcement: Announcement) -> Self {
        PresenceRecord {
            identity: Identity {
                id: announcement.user_id,
                email: announcement.email,
                name: announcement.name,
                avatar_url: announcement.avatar_url,
            },
            status: announcement.status,
            last_seen: announcement.last_seen,
            active_rooms: announcement.active_rooms.into_iter().collect(),
            is_typing: announcement.is_typing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> Identity {
        Identity::new("alice")
            .with_name("Alice")
            .with_email("alice@example.com")
    }

    #[test]
    fn online_announcement_carries_the_current_room() {
        let room = "room-1".to_string();
        let now = Utc::now();
        let a = build_announcement(&alice(), Activity::Online, Some(&room), true, now);

        assert_eq!(a.user_id, "alice");
        assert_eq!(a.name.as_deref(), Some("Alice"));
        assert_eq!(a.status, PresenceStatus::Online);
        assert_eq!(a.active_rooms, vec!["room-1".to_string()]);
        assert!(a.is_typing);
        assert_eq!(a.last_seen, now);
    }

    #[test]
    fn online_announcement_without_room_has_no_rooms() {
        let a = build_announcement(&alice(), Activity::Online, None, false, Utc::now());
        assert!(a.active_rooms.is_empty());
    }

    #[test]
    fn away_announcement_clears_rooms_and_typing() {
        let room = "room-1".to_string();
        let a = build_announcement(&alice(), Activity::Away, Some(&room), true, Utc::now());

        assert_eq!(a.status, PresenceStatus::Away);
        assert!(a.active_rooms.is_empty());
        assert!(!a.is_typing);
    }

    #[test]
    fn parse_ignores_provider_fields_and_fills_defaults() {
        let raw = json!({ "user_id": "bob", "presence_ref": "abc" });
        let a = Announcement::parse(&raw).unwrap();

        assert_eq!(a.user_id, "bob");
        assert_eq!(a.status, PresenceStatus::Online);
        assert_eq!(a.last_seen, DateTime::<Utc>::UNIX_EPOCH);
        assert!(a.active_rooms.is_empty());
        assert!(!a.is_typing);
    }

    #[test]
    fn parse_rejects_entries_without_a_user() {
        assert!(Announcement::parse(&json!({ "status": "online" })).is_err());
        assert!(Announcement::parse(&json!({ "user_id": "  " })).is_err());
        assert!(Announcement::parse(&json!({ "user_id": 42 })).is_err());
        assert!(Announcement::parse(&json!("alice")).is_err());
    }

    #[test]
    fn parse_keeps_rows_with_unreadable_optional_fields() {
        let raw = json!({
            "user_id": "bob",
            "name": "Bob",
            "status": "busy",
            "active_rooms": null,
            "last_seen": "yesterday",
            "is_typing": "yes",
        });
        let a = Announcement::parse(&raw).unwrap();

        assert_eq!(a.user_id, "bob");
        assert_eq!(a.name.as_deref(), Some("Bob"));
        assert_eq!(a.status, PresenceStatus::Online);
        assert_eq!(a.last_seen, DateTime::<Utc>::UNIX_EPOCH);
        assert!(a.active_rooms.is_empty());
        assert!(!a.is_typing);
    }

    #[test]
    fn parse_reads_an_away_row() {
        let raw = json!({ "user_id": "bob", "status": "away", "active_rooms": ["room-1"] });
        let a = Announcement::parse(&raw).unwrap();

        assert_eq!(a.status, PresenceStatus::Away);
        assert_eq!(a.active_rooms, vec!["room-1".to_string()]);
    }

    #[test]
    fn announcement_becomes_a_record() {
        let room = "lobby".to_string();
        let a = build_announcement(&alice(), Activity::Online, Some(&room), false, Utc::now());
        let record = PresenceRecord::from(Announcement::parse(&a.to_value()).unwrap());

        assert_eq!(record.identity, alice());
        assert!(record.is_in_room("lobby"));
        assert_eq!(record.status, PresenceStatus::Online);
    }
}
