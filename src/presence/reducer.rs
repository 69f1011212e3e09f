use tracing::{trace, warn};

use super::{Announcement, PresenceRecord, PresenceState, TypingEvent};
use crate::channel::RawSnapshot;

/// Rebuilds the canonical state from a full snapshot of the presence table.
///
/// Each key may carry several raw rows (one per session). Rows are read in
/// provider order and the last usable row for a user wins; rows without a
/// usable `user_id` are dropped. Nothing from the previous state survives.
pub fn apply_snapshot(raw: &RawSnapshot) -> PresenceState {
    let mut state = PresenceState::default();

    for (key, rows) in raw {
        for row in rows {
            match Announcement::parse(row) {
                Ok(announcement) => {
                    trace!(%key, user_id = %announcement.user_id, "Reducing presence row");
                    state.insert(PresenceRecord::from(announcement));
                }
                Err(e) => {
                    warn!(%key, error = %e, "Skipping malformed presence row");
                }
            }
        }
    }

    state
}

/// Applies an ephemeral typing event to `is_typing` only.
///
/// With a `scope`, events for any other room are ignored. Events for users
/// absent from the state are ignored as well. Returns whether the state changed.
pub fn apply_typing(state: &mut PresenceState, event: &TypingEvent, scope: Option<&str>) -> bool {
    if let Some(scope) = scope {
        if event.room_id.as_deref() != Some(scope) {
            trace!(user_id = %event.user_id, room_id = ?event.room_id, %scope, "Typing event outside scope");
            return false;
        }
    }

    match state.get_mut(&event.user_id) {
        Some(record) if record.is_typing != event.is_typing => {
            record.is_typing = event.is_typing;
            true
        }
        Some(_) => false,
        None => {
            trace!(user_id = %event.user_id, "Typing event for unknown user");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;
    use serde_json::{Value, json};

    fn row(user: &str, rooms: &[&str]) -> Value {
        json!({
            "user_id": user,
            "name": user.to_uppercase(),
            "status": "online",
            "last_seen": "2026-01-01T00:00:00Z",
            "active_rooms": rooms,
            "is_typing": false,
            "presence_ref": format!("ref-{user}"),
        })
    }

    fn snapshot(entries: Vec<(&str, Vec<Value>)>) -> RawSnapshot {
        entries
            .into_iter()
            .map(|(key, rows)| (key.to_string(), rows))
            .collect()
    }

    fn typing(user: &str, room: Option<&str>, is_typing: bool) -> TypingEvent {
        TypingEvent {
            user_id: user.to_string(),
            room_id: room.map(str::to_string),
            is_typing,
        }
    }

    #[test]
    fn applying_the_same_snapshot_twice_is_idempotent() {
        let raw = snapshot(vec![
            ("alice", vec![row("alice", &["lobby"])]),
            ("bob", vec![row("bob", &["lobby", "dev"])]),
        ]);

        let first = apply_snapshot(&raw);
        let second = apply_snapshot(&raw);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn users_missing_from_the_snapshot_are_dropped() {
        let before = apply_snapshot(&snapshot(vec![
            ("alice", vec![row("alice", &["lobby"])]),
            ("bob", vec![row("bob", &["lobby"])]),
        ]));
        assert!(before.contains("bob"));

        let after = apply_snapshot(&snapshot(vec![("alice", vec![row("alice", &["lobby"])])]));

        assert!(after.contains("alice"));
        assert!(!after.contains("bob"));
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn last_row_wins_for_the_same_user() {
        let mut away = row("alice", &[]);
        away["status"] = json!("away");
        let raw = snapshot(vec![("alice", vec![row("alice", &["lobby"]), away])]);

        let state = apply_snapshot(&raw);
        let alice = state.get("alice").unwrap();

        assert_eq!(state.len(), 1);
        assert_eq!(alice.status, PresenceStatus::Away);
        assert!(alice.active_rooms.is_empty());
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let raw = snapshot(vec![
            ("alice", vec![row("alice", &["lobby"])]),
            ("ghost", vec![json!({ "name": "no id" }), json!(null)]),
            ("carol", vec![json!({ "user_id": "" })]),
        ]);

        let state = apply_snapshot(&raw);

        assert_eq!(state.user_ids().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn rows_from_other_versions_keep_their_user() {
        let raw = snapshot(vec![(
            "erin",
            vec![json!({ "user_id": "erin", "status": "busy", "active_rooms": null })],
        )]);

        let state = apply_snapshot(&raw);

        let erin = state.get("erin").unwrap();
        assert_eq!(erin.status, PresenceStatus::Online);
        assert!(erin.active_rooms.is_empty());
    }

    #[test]
    fn records_are_keyed_by_user_id_not_presence_key() {
        let raw = snapshot(vec![("connection-7", vec![row("dave", &[])])]);
        let state = apply_snapshot(&raw);
        assert!(state.contains("dave"));
        assert!(!state.contains("connection-7"));
    }

    #[test]
    fn typing_event_touches_only_is_typing_of_its_user() {
        let mut state = apply_snapshot(&snapshot(vec![
            ("alice", vec![row("alice", &["x"])]),
            ("bob", vec![row("bob", &["x"])]),
        ]));
        let before = state.clone();

        assert!(apply_typing(&mut state, &typing("alice", Some("x"), true), None));

        let alice = state.get("alice").unwrap();
        let old_alice = before.get("alice").unwrap();
        assert!(alice.is_typing);
        assert_eq!(alice.identity, old_alice.identity);
        assert_eq!(alice.status, old_alice.status);
        assert_eq!(alice.last_seen, old_alice.last_seen);
        assert_eq!(alice.active_rooms, old_alice.active_rooms);
        assert_eq!(state.get("bob"), before.get("bob"));
    }

    #[test]
    fn typing_event_outside_scope_is_ignored() {
        let mut state = apply_snapshot(&snapshot(vec![("alice", vec![row("alice", &["x"])])]));

        assert!(!apply_typing(&mut state, &typing("alice", Some("y"), true), Some("x")));
        assert!(!apply_typing(&mut state, &typing("alice", None, true), Some("x")));
        assert!(!state.get("alice").unwrap().is_typing);

        assert!(apply_typing(&mut state, &typing("alice", Some("x"), true), Some("x")));
        assert!(state.get("alice").unwrap().is_typing);
    }

    #[test]
    fn typing_event_for_unknown_user_changes_nothing() {
        let mut state = apply_snapshot(&snapshot(vec![("alice", vec![row("alice", &[])])]));
        let before = state.clone();

        assert!(!apply_typing(&mut state, &typing("zed", None, true), None));
        assert_eq!(state, before);
    }

    #[test]
    fn next_snapshot_replaces_ephemeral_typing() {
        let raw = snapshot(vec![("alice", vec![row("alice", &["x"])])]);
        let mut state = apply_snapshot(&raw);
        apply_typing(&mut state, &typing("alice", Some("x"), true), None);

        let state = apply_snapshot(&raw);
        assert!(!state.get("alice").unwrap().is_typing);
    }
}
