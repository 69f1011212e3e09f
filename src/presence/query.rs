use super::{PresenceRecord, PresenceState};

impl PresenceState {
    /// Records whose `active_rooms` contains `room_id`, in user id order.
    pub fn users_in_room(&self, room_id: &str) -> Vec<PresenceRecord> {
        self.records()
            .filter(|record| record.is_in_room(room_id))
            .cloned()
            .collect()
    }

    /// Records currently typing, optionally restricted to one room.
    pub fn typing_users(&self, room_id: Option<&str>) -> Vec<PresenceRecord> {
        self.records()
            .filter(|record| record.is_typing)
            .filter(|record| room_id.is_none_or(|room| record.is_in_room(room)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::{identity::Identity, presence::PresenceStatus};

    fn record(user: &str, rooms: &[&str], is_typing: bool) -> PresenceRecord {
        PresenceRecord {
            identity: Identity::new(user),
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            active_rooms: rooms.iter().map(|r| r.to_string()).collect(),
            is_typing,
        }
    }

    fn ids(records: &[PresenceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.user_id().as_str()).collect()
    }

    #[test]
    fn room_membership_matches_active_rooms() {
        let state: PresenceState = vec![
            record("a", &["x"], false),
            record("b", &["x", "y"], false),
            record("c", &[], false),
        ]
        .into_iter()
        .collect();

        let rooms: BTreeSet<&str> = ["x", "y", "z"].into();
        for room in rooms {
            let members = state.users_in_room(room);
            for r in state.records() {
                let listed = members.iter().any(|m| m.user_id() == r.user_id());
                assert_eq!(listed, r.active_rooms.contains(room), "{} in {}", r.user_id(), room);
            }
        }
        assert_eq!(ids(&state.users_in_room("x")), vec!["a", "b"]);
        assert!(state.users_in_room("z").is_empty());
    }

    #[test]
    fn typing_users_can_be_scoped_to_a_room() {
        let state: PresenceState = vec![
            record("a", &["x"], true),
            record("b", &["y"], true),
            record("c", &["x"], false),
        ]
        .into_iter()
        .collect();

        assert_eq!(ids(&state.typing_users(Some("x"))), vec!["a"]);
        assert_eq!(ids(&state.typing_users(None)), vec!["a", "b"]);
        assert!(state.typing_users(Some("z")).is_empty());
    }
}
