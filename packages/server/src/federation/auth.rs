//! Matrix event authorization rules
//!
//! `allowed` checks a candidate event against the room state the core
//! computed for it. The rules here are the subset of the Matrix auth
//! algorithm that governs federation ingress: create/federate constraints,
//! membership transitions under the room's join rule, and power level
//! requirements.

use std::collections::HashMap;

use serde_json::Value;

use fedrix_entity::types::{Event, StateTuple};

/// An event failed the auth rules against the supplied state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("event {event_id:?} not allowed: {reason}")]
pub struct NotAllowedError {
    pub event_id: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthStateError {
    #[error("event {0:?} is not a state event")]
    NotStateEvent(String),
}

/// The state tuples the Matrix auth rules consult for `event`.
pub fn state_needed_for_auth(event: &Event) -> Vec<StateTuple> {
    let mut tuples = vec![
        StateTuple::new("m.room.create", ""),
        StateTuple::new("m.room.power_levels", ""),
        StateTuple::new("m.room.join_rules", ""),
        StateTuple::new("m.room.member", event.sender.clone()),
    ];

    if event.event_type == "m.room.member" {
        if let Some(target) = &event.state_key {
            tuples.push(StateTuple::new("m.room.member", target.clone()));
        }
        if let Some(token) = event
            .content
            .get("third_party_invite")
            .and_then(|tpi| tpi.get("signed"))
            .and_then(|signed| signed.get("token"))
            .and_then(Value::as_str)
        {
            tuples.push(StateTuple::new("m.room.third_party_invite", token));
        }
    }

    tuples.dedup();
    tuples
}

/// A set of state events indexed by `(type, state_key)`, the shape the
/// auth rules consume.
#[derive(Debug, Default)]
pub struct AuthState {
    events: HashMap<(String, String), Event>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: &Event) -> Result<(), AuthStateError> {
        let state_key = event
            .state_key
            .clone()
            .ok_or_else(|| AuthStateError::NotStateEvent(event.event_id.clone()))?;
        self.events
            .insert((event.event_type.clone(), state_key), event.clone());
        Ok(())
    }

    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<Self, AuthStateError> {
        let mut state = Self::new();
        for event in events {
            state.add_event(event)?;
        }
        Ok(state)
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.events
            .get(&(event_type.to_string(), state_key.to_string()))
    }

    fn membership_of(&self, user_id: &str) -> Option<&str> {
        self.get("m.room.member", user_id)
            .and_then(|e| e.content.get("membership"))
            .and_then(Value::as_str)
    }

    fn join_rule(&self) -> &str {
        self.get("m.room.join_rules", "")
            .and_then(|e| e.content.get("join_rule"))
            .and_then(Value::as_str)
            .unwrap_or("invite")
    }

    fn power_levels(&self) -> Option<&Value> {
        self.get("m.room.power_levels", "").map(|e| &e.content)
    }

    fn user_level(&self, user_id: &str) -> i64 {
        if let Some(levels) = self.power_levels() {
            if let Some(level) = levels
                .get("users")
                .and_then(|u| u.get(user_id))
                .and_then(Value::as_i64)
            {
                return level;
            }
            return levels.get("users_default").and_then(Value::as_i64).unwrap_or(0);
        }
        // Without a power_levels event the room creator has level 100.
        let creator = self
            .get("m.room.create", "")
            .map(|c| {
                c.content
                    .get("creator")
                    .and_then(Value::as_str)
                    .unwrap_or(&c.sender)
                    .to_string()
            })
            .unwrap_or_default();
        if creator == user_id {
            100
        } else {
            0
        }
    }

    fn action_level(&self, action: &str, default: i64) -> i64 {
        self.power_levels()
            .and_then(|levels| levels.get(action))
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    fn required_level_for_event(&self, event: &Event) -> i64 {
        if let Some(level) = self
            .power_levels()
            .and_then(|levels| levels.get("events"))
            .and_then(|events| events.get(&event.event_type))
            .and_then(Value::as_i64)
        {
            return level;
        }
        if event.is_state_event() {
            self.action_level("state_default", 50)
        } else {
            self.action_level("events_default", 0)
        }
    }
}

fn deny(event: &Event, reason: impl Into<String>) -> NotAllowedError {
    NotAllowedError {
        event_id: event.event_id.clone(),
        reason: reason.into(),
    }
}

/// Check `event` against the Matrix auth rules using `state` as the room
/// state before the event.
pub fn allowed(event: &Event, state: &AuthState) -> Result<(), NotAllowedError> {
    if event.event_type == "m.room.create" {
        return allowed_create(event);
    }

    let create = state
        .get("m.room.create", "")
        .ok_or_else(|| deny(event, "no m.room.create event in auth state"))?;

    let create_server = create.sender_server().unwrap_or_default();
    let sender_server = event.sender_server().unwrap_or_default();
    let federate = create
        .content
        .get("m.federate")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !federate && sender_server != create_server {
        return Err(deny(event, "room does not federate"));
    }

    if event.event_type == "m.room.member" {
        return allowed_membership(event, state);
    }

    if state.membership_of(&event.sender) != Some("join") {
        return Err(deny(event, format!("sender {:?} is not in the room", event.sender)));
    }

    let sender_level = state.user_level(&event.sender);
    let required = state.required_level_for_event(event);
    if sender_level < required {
        return Err(deny(
            event,
            format!(
                "sender power level {sender_level} is below the required level {required} for {:?}",
                event.event_type
            ),
        ));
    }

    if event.event_type == "m.room.power_levels" {
        return allowed_power_level_change(event, state, sender_level);
    }

    Ok(())
}

fn allowed_create(event: &Event) -> Result<(), NotAllowedError> {
    if !event.prev_event_ids().is_empty() {
        return Err(deny(event, "m.room.create cannot have prev_events"));
    }
    let room_server = event.room_id.split_once(':').map(|(_, s)| s).unwrap_or_default();
    if event.sender_server() != Some(room_server) {
        return Err(deny(event, "m.room.create sender must be on the room's server"));
    }
    Ok(())
}

fn allowed_membership(event: &Event, state: &AuthState) -> Result<(), NotAllowedError> {
    let target = event
        .state_key
        .as_deref()
        .ok_or_else(|| deny(event, "membership event has no state_key"))?;
    let membership = event
        .content
        .get("membership")
        .and_then(Value::as_str)
        .ok_or_else(|| deny(event, "membership event has no membership field"))?;

    let sender_membership = state.membership_of(&event.sender);
    let target_membership = state.membership_of(target);
    let sender_level = state.user_level(&event.sender);
    let target_level = state.user_level(target);

    match membership {
        "join" => {
            if event.sender != target {
                return Err(deny(event, "cannot join on behalf of another user"));
            }
            if target_membership == Some("ban") {
                return Err(deny(event, "user is banned from the room"));
            }
            if target_membership == Some("join") {
                return Ok(());
            }
            match state.join_rule() {
                "public" => Ok(()),
                "invite" | "knock" | "restricted" => {
                    if target_membership == Some("invite") {
                        Ok(())
                    } else {
                        Err(deny(event, "room requires an invite to join"))
                    }
                }
                other => Err(deny(event, format!("unknown join rule {other:?}"))),
            }
        }
        "invite" => {
            if event.content.get("third_party_invite").is_some() {
                return allowed_third_party_invite(event, state);
            }
            if sender_membership != Some("join") {
                return Err(deny(event, "inviter is not in the room"));
            }
            if target_membership == Some("ban") {
                return Err(deny(event, "cannot invite a banned user"));
            }
            if target_membership == Some("join") {
                return Err(deny(event, "user is already in the room"));
            }
            if sender_level < state.action_level("invite", 0) {
                return Err(deny(event, "sender cannot invite users"));
            }
            Ok(())
        }
        "leave" => {
            if event.sender == target {
                match sender_membership {
                    Some("join") | Some("invite") | Some("knock") => Ok(()),
                    _ => Err(deny(event, "user is not in the room")),
                }
            } else {
                if sender_membership != Some("join") {
                    return Err(deny(event, "kicker is not in the room"));
                }
                if target_membership == Some("ban")
                    && sender_level < state.action_level("ban", 50)
                {
                    return Err(deny(event, "sender cannot unban users"));
                }
                if sender_level < state.action_level("kick", 50) || sender_level <= target_level {
                    return Err(deny(event, "sender cannot kick this user"));
                }
                Ok(())
            }
        }
        "ban" => {
            if sender_membership != Some("join") {
                return Err(deny(event, "sender is not in the room"));
            }
            if sender_level < state.action_level("ban", 50) || sender_level <= target_level {
                return Err(deny(event, "sender cannot ban this user"));
            }
            Ok(())
        }
        "knock" => {
            if event.sender != target {
                return Err(deny(event, "cannot knock on behalf of another user"));
            }
            if state.join_rule() != "knock" {
                return Err(deny(event, "room does not accept knocks"));
            }
            match target_membership {
                Some("ban") | Some("join") => Err(deny(event, "user cannot knock")),
                _ => Ok(()),
            }
        }
        other => Err(deny(event, format!("unknown membership {other:?}"))),
    }
}

fn allowed_third_party_invite(event: &Event, state: &AuthState) -> Result<(), NotAllowedError> {
    let token = event
        .content
        .get("third_party_invite")
        .and_then(|tpi| tpi.get("signed"))
        .and_then(|signed| signed.get("token"))
        .and_then(Value::as_str)
        .ok_or_else(|| deny(event, "third party invite has no token"))?;
    if state.get("m.room.third_party_invite", token).is_none() {
        return Err(deny(event, format!("no third party invite for token {token:?}")));
    }
    Ok(())
}

fn allowed_power_level_change(
    event: &Event,
    state: &AuthState,
    sender_level: i64,
) -> Result<(), NotAllowedError> {
    let old_users = state
        .power_levels()
        .and_then(|levels| levels.get("users"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let new_users = event
        .content
        .get("users")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (user_id, new_level) in &new_users {
        let old = old_users.get(user_id).and_then(Value::as_i64);
        let new = new_level.as_i64().unwrap_or(0);
        if user_id != &event.sender {
            if let Some(old) = old {
                if old >= sender_level {
                    return Err(deny(
                        event,
                        format!("cannot change the level of {user_id:?} at or above own level"),
                    ));
                }
            }
        }
        if new > sender_level {
            return Err(deny(
                event,
                format!("cannot raise {user_id:?} above own level"),
            ));
        }
    }
    for (user_id, old_level) in &old_users {
        if !new_users.contains_key(user_id)
            && user_id != &event.sender
            && old_level.as_i64().unwrap_or(0) >= sender_level
        {
            return Err(deny(
                event,
                format!("cannot remove the level of {user_id:?} at or above own level"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_event(event_type: &str, state_key: &str, sender: &str, content: Value) -> Event {
        Event {
            event_id: format!("${}_{}:a", event_type.replace('.', "_"), state_key.len()),
            sender: sender.to_string(),
            origin_server_ts: 1,
            event_type: event_type.to_string(),
            room_id: "!r:a".to_string(),
            content,
            state_key: Some(state_key.to_string()),
            unsigned: None,
            auth_events: None,
            depth: Some(1),
            hashes: None,
            prev_events: Some(vec!["$c:a".to_string()]),
            signatures: None,
            redacts: None,
        }
    }

    fn message(sender: &str) -> Event {
        Event {
            event_id: "$m:a".to_string(),
            sender: sender.to_string(),
            origin_server_ts: 2,
            event_type: "m.room.message".to_string(),
            room_id: "!r:a".to_string(),
            content: json!({"msgtype": "m.text", "body": "hi"}),
            state_key: None,
            unsigned: None,
            auth_events: None,
            depth: Some(2),
            hashes: None,
            prev_events: Some(vec!["$c:a".to_string()]),
            signatures: None,
            redacts: None,
        }
    }

    fn room_state(members: &[&str]) -> AuthState {
        let mut events = vec![state_event("m.room.create", "", "@admin:a", json!({"creator": "@admin:a"}))];
        for member in members {
            events.push(state_event("m.room.member", member, member, json!({"membership": "join"})));
        }
        AuthState::from_events(events.iter()).unwrap()
    }

    #[test]
    fn member_can_send_message() {
        let state = room_state(&["@u:b"]);
        assert!(allowed(&message("@u:b"), &state).is_ok());
    }

    #[test]
    fn non_member_cannot_send_message() {
        let state = room_state(&[]);
        let err = allowed(&message("@u:b"), &state).unwrap_err();
        assert!(err.reason.contains("not in the room"));
    }

    #[test]
    fn banned_user_cannot_join() {
        let events = vec![
            state_event("m.room.create", "", "@admin:a", json!({"creator": "@admin:a"})),
            state_event("m.room.join_rules", "", "@admin:a", json!({"join_rule": "public"})),
            state_event("m.room.member", "@evil:b", "@admin:a", json!({"membership": "ban"})),
        ];
        let state = AuthState::from_events(events.iter()).unwrap();
        let join = state_event("m.room.member", "@evil:b", "@evil:b", json!({"membership": "join"}));
        assert!(allowed(&join, &state).is_err());
    }

    #[test]
    fn invite_only_room_rejects_uninvited_join() {
        let state = room_state(&[]);
        let join = state_event("m.room.member", "@u:b", "@u:b", json!({"membership": "join"}));
        let err = allowed(&join, &state).unwrap_err();
        assert!(err.reason.contains("invite"));
    }

    #[test]
    fn invited_user_can_join() {
        let events = vec![
            state_event("m.room.create", "", "@admin:a", json!({"creator": "@admin:a"})),
            state_event("m.room.member", "@u:b", "@admin:a", json!({"membership": "invite"})),
        ];
        let state = AuthState::from_events(events.iter()).unwrap();
        let join = state_event("m.room.member", "@u:b", "@u:b", json!({"membership": "join"}));
        assert!(allowed(&join, &state).is_ok());
    }

    #[test]
    fn power_level_gate_applies_to_state_events() {
        let events = vec![
            state_event("m.room.create", "", "@admin:a", json!({"creator": "@admin:a"})),
            state_event("m.room.member", "@u:b", "@u:b", json!({"membership": "join"})),
            state_event(
                "m.room.power_levels",
                "",
                "@admin:a",
                json!({"users": {"@admin:a": 100}, "state_default": 50}),
            ),
        ];
        let state = AuthState::from_events(events.iter()).unwrap();
        let topic = state_event("m.room.topic", "", "@u:b", json!({"topic": "x"}));
        let err = allowed(&topic, &state).unwrap_err();
        assert!(err.reason.contains("power level"));
    }

    #[test]
    fn state_needed_covers_membership_targets() {
        let join = state_event("m.room.member", "@u:b", "@u:b", json!({"membership": "join"}));
        let needed = state_needed_for_auth(&join);
        assert!(needed.contains(&StateTuple::new("m.room.member", "@u:b")));
        assert!(needed.contains(&StateTuple::new("m.room.create", "")));
    }
}
