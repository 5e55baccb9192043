//! State resolution
//!
//! Given a pile of possibly conflicting state events and the auth events
//! backing them, produce a single room state. This is the seam where
//! room-version variants plug in; the core treats it as a pure function
//! with no collaborator access.

use std::collections::HashMap;

use tracing::debug;

use fedrix_entity::types::Event;

use crate::federation::auth::{allowed, AuthState};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("event {0:?} in the state set is not a state event")]
    NotStateEvent(String),
}

/// Resolve `state_events` into a single state, consulting `auth_events`
/// when candidates conflict.
///
/// Unconflicted slots pass through untouched. For a conflicted slot the
/// candidates are ordered by authority and the first one the auth events
/// permit wins; if none is permitted the highest-authority candidate is
/// kept so the slot never vanishes. The ordering is deterministic, so
/// identical inputs always resolve identically.
pub fn resolve_conflicts(
    room_version: &str,
    state_events: Vec<Event>,
    auth_events: Vec<Event>,
) -> Result<Vec<Event>, ResolveError> {
    let mut slots: HashMap<(String, String), Vec<Event>> = HashMap::new();
    for event in state_events {
        let state_key = event
            .state_key
            .clone()
            .ok_or_else(|| ResolveError::NotStateEvent(event.event_id.clone()))?;
        slots
            .entry((event.event_type.clone(), state_key))
            .or_default()
            .push(event);
    }

    let auth_state = build_auth_state(&auth_events);

    let mut resolved: Vec<Event> = Vec::with_capacity(slots.len());
    for ((event_type, state_key), mut candidates) in slots {
        dedup_by_event_id(&mut candidates);
        if candidates.len() == 1 {
            if let Some(only) = candidates.pop() {
                resolved.push(only);
            }
            continue;
        }

        debug!(
            event_type = %event_type,
            state_key = %state_key,
            candidates = candidates.len(),
            "Resolving conflicted state slot"
        );
        sort_by_authority(room_version, &mut candidates);
        let winner = candidates
            .iter()
            .find(|candidate| allowed(candidate, &auth_state).is_ok())
            .or_else(|| candidates.first());
        let Some(winner) = winner else { continue };
        resolved.push(winner.clone());
    }

    // A deterministic output order keeps downstream snapshots byte-stable.
    resolved.sort_by(|a, b| {
        (&a.event_type, &a.state_key).cmp(&(&b.event_type, &b.state_key))
    });
    Ok(resolved)
}

fn build_auth_state(auth_events: &[Event]) -> AuthState {
    let mut state = AuthState::new();
    for event in auth_events {
        // Non-state events cannot participate in authorization.
        let _ = state.add_event(event);
    }
    state
}

fn dedup_by_event_id(candidates: &mut Vec<Event>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|e| seen.insert(e.event_id.clone()));
}

/// Order candidates from most to least authoritative. Version 1 rooms
/// predate depth-based comparison and order on origin timestamps alone;
/// later versions prefer the deepest candidate first.
fn sort_by_authority(room_version: &str, candidates: &mut [Event]) {
    match room_version {
        "1" => candidates.sort_by(|a, b| {
            (b.origin_server_ts, &b.event_id).cmp(&(a.origin_server_ts, &a.event_id))
        }),
        _ => candidates.sort_by(|a, b| {
            (b.depth.unwrap_or(0), b.origin_server_ts, &b.event_id).cmp(&(
                a.depth.unwrap_or(0),
                a.origin_server_ts,
                &a.event_id,
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_event(
        event_id: &str,
        event_type: &str,
        state_key: &str,
        sender: &str,
        depth: i64,
        ts: i64,
        content: serde_json::Value,
    ) -> Event {
        Event {
            event_id: event_id.to_string(),
            sender: sender.to_string(),
            origin_server_ts: ts,
            event_type: event_type.to_string(),
            room_id: "!r:a".to_string(),
            content,
            state_key: Some(state_key.to_string()),
            unsigned: None,
            auth_events: None,
            depth: Some(depth),
            hashes: None,
            prev_events: None,
            signatures: None,
            redacts: None,
        }
    }

    fn base_auth() -> Vec<Event> {
        vec![
            state_event("$c:a", "m.room.create", "", "@admin:a", 0, 1, json!({"creator": "@admin:a"})),
            state_event(
                "$adm:a",
                "m.room.member",
                "@admin:a",
                "@admin:a",
                1,
                2,
                json!({"membership": "join"}),
            ),
        ]
    }

    #[test]
    fn unconflicted_state_passes_through() {
        let state = vec![state_event(
            "$t:a",
            "m.room.topic",
            "",
            "@admin:a",
            3,
            5,
            json!({"topic": "hello"}),
        )];
        let resolved = resolve_conflicts("2", state, base_auth()).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].event_id, "$t:a");
    }

    #[test]
    fn deeper_authorized_candidate_wins() {
        let state = vec![
            state_event("$t1:a", "m.room.topic", "", "@admin:a", 3, 5, json!({"topic": "old"})),
            state_event("$t2:a", "m.room.topic", "", "@admin:a", 7, 9, json!({"topic": "new"})),
        ];
        let resolved = resolve_conflicts("2", state, base_auth()).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].event_id, "$t2:a");
    }

    #[test]
    fn unauthorized_candidate_loses_to_authorized_one() {
        // The deeper topic comes from a sender who is not in the room.
        let state = vec![
            state_event("$t1:a", "m.room.topic", "", "@admin:a", 3, 5, json!({"topic": "ok"})),
            state_event("$t2:a", "m.room.topic", "", "@evil:b", 7, 9, json!({"topic": "bad"})),
        ];
        let resolved = resolve_conflicts("2", state, base_auth()).unwrap();
        assert_eq!(resolved[0].event_id, "$t1:a");
    }

    #[test]
    fn resolution_is_deterministic() {
        let state = vec![
            state_event("$t1:a", "m.room.topic", "", "@admin:a", 3, 5, json!({"topic": "a"})),
            state_event("$t2:a", "m.room.topic", "", "@admin:a", 3, 5, json!({"topic": "b"})),
        ];
        let forward = resolve_conflicts("2", state.clone(), base_auth()).unwrap();
        let reversed = resolve_conflicts(
            "2",
            state.into_iter().rev().collect(),
            base_auth(),
        )
        .unwrap();
        assert_eq!(forward[0].event_id, reversed[0].event_id);
    }

    #[test]
    fn rejects_non_state_event_in_state_set() {
        let mut message = state_event("$m:a", "m.room.message", "", "@admin:a", 2, 3, json!({}));
        message.state_key = None;
        assert!(resolve_conflicts("2", vec![message], base_auth()).is_err());
    }
}
