//! Reconstructing room state around a backwards extremity
//!
//! The state *before* an event is looked up locally when the room-server
//! holds it, otherwise fetched from the sender via `/state_ids` (bodies
//! filled in from local storage or `/event`), with `/state` as a last
//! resort when `/state_ids` itself fails. The state *after* the extremity
//! is the union of the states before its prev_events, resolved, checked
//! against the auth rules, and rolled forward by the extremity itself.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use fedrix_entity::types::{Event, HeaderedEvent, StateSnapshot};

use crate::federation::auth::{allowed, AuthState};
use crate::federation::client::FederationApiError;
use crate::federation::error::TxnError;
use crate::federation::event_verifier::parse_untrusted;
use crate::federation::resolver::resolve_conflicts;
use crate::federation::transaction::TxnProcessor;

enum SnapshotIssue {
    MissingAuthEvent(String),
}

impl TxnProcessor {
    /// The room state after `extremity`: all states before it resolved via
    /// state resolution, the extremity auth-checked against the result,
    /// then applied to it when it is a state event. Also returns the ids
    /// of snapshot events the local server already held.
    pub(crate) async fn lookup_state_after_event(
        &self,
        extremity: &HeaderedEvent,
    ) -> Result<(StateSnapshot, HashSet<String>), TxnError> {
        let room_version = extremity.room_version.clone();

        let mut auth_by_id: HashMap<String, Event> = HashMap::new();
        let mut state_by_id: HashMap<String, Event> = HashMap::new();
        let mut have_event_ids: HashSet<String> = HashSet::new();

        for prev_id in extremity.event.prev_event_ids() {
            let (state, have) = self
                .lookup_state_before_event(&room_version, extremity.room_id(), prev_id)
                .await?;
            for event in state.state_events {
                state_by_id.insert(event.event_id.clone(), event);
            }
            for event in state.auth_events {
                auth_by_id.insert(event.event_id.clone(), event);
            }
            have_event_ids.extend(have);

            // The prev event itself is part of the state after it when it
            // is a state event.
            let prev = self.lookup_event(&room_version, prev_id).await?;
            if prev.event.is_state_event() {
                state_by_id.insert(prev.event.event_id.clone(), prev.event);
            }
        }

        let mut auth_events: Vec<Event> = auth_by_id.into_values().collect();
        auth_events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        let state_events: Vec<Event> = state_by_id.into_values().collect();

        let mut resolved =
            resolve_conflicts(&room_version, state_events, auth_events.clone())?;

        let auth_state = AuthState::from_events(resolved.iter())
            .map_err(|e| TxnError::InvalidStateSnapshot(e.to_string()))?;
        allowed(&extremity.event, &auth_state)?;

        if extremity.event.is_state_event() {
            let slot = resolved.iter_mut().find(|ev| {
                ev.event_type == extremity.event.event_type
                    && ev.state_key == extremity.event.state_key
            });
            match slot {
                Some(slot) => *slot = extremity.event.clone(),
                None => {
                    resolved.push(extremity.event.clone());
                    resolved.sort_by(|a, b| {
                        (&a.event_type, &a.state_key).cmp(&(&b.event_type, &b.state_key))
                    });
                }
            }
        }

        let mut snapshot = StateSnapshot {
            auth_events,
            state_events: resolved,
        };
        self.check_snapshot(&mut snapshot, &room_version).await?;
        Ok((snapshot, have_event_ids))
    }

    /// The room state before `event_id`, locally when possible.
    pub(crate) async fn lookup_state_before_event(
        &self,
        room_version: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(StateSnapshot, HashSet<String>), TxnError> {
        self.ensure_active()?;
        debug!(event_id = %event_id, "Looking up state before event");

        // The room-server answers with state only when it holds every
        // requested prev event, so a query for just this id tells us
        // whether the state is known locally.
        let ids = [event_id.to_string()];
        match self
            .roomserver
            .query_state_after_events(room_id, &ids, None)
            .await
        {
            Ok(resp)
                if resp.room_exists
                    && resp.prev_events_exist
                    && !resp.state_events.is_empty() =>
            {
                debug!(event_id = %event_id, "State before event is known locally");
                let mut have_event_ids = HashSet::new();
                let mut held: HashMap<&str, &Event> = HashMap::new();
                for headered in &resp.state_events {
                    have_event_ids.insert(headered.event_id().to_string());
                    held.insert(headered.event_id(), &headered.event);
                }
                // Auth events are drawn from the same returned set; ids we
                // do not hold get repaired by the snapshot check later.
                let mut auth_events: Vec<Event> = Vec::new();
                let mut seen = HashSet::new();
                for headered in &resp.state_events {
                    for auth_id in headered.event.auth_event_ids() {
                        if let Some(event) = held.get(auth_id.as_str()) {
                            if seen.insert(auth_id.clone()) {
                                auth_events.push((*event).clone());
                            }
                        }
                    }
                }
                let snapshot = StateSnapshot {
                    auth_events,
                    state_events: resp.state_events.into_iter().map(|h| h.event).collect(),
                };
                return Ok((snapshot, have_event_ids));
            }
            Ok(_) => {
                debug!(event_id = %event_id, "State before event unknown locally, asking remote");
            }
            Err(err) => {
                warn!(event_id = %event_id, error = %err, "Local state lookup failed, asking remote");
            }
        }

        // /state_ids first; /state only when /state_ids itself errors. One
        // fallback chain per extremity: body fetch failures past this point
        // fail the event rather than starting over.
        let state_ids = match self
            .federation
            .lookup_state_ids(&self.origin, room_id, event_id)
            .await
        {
            Ok(state_ids) => state_ids,
            Err(err) => {
                warn!(
                    event_id = %event_id,
                    error = %err,
                    "/state_ids failed, falling back to /state"
                );
                let snapshot = self
                    .lookup_missing_state_via_state(room_version, room_id, event_id)
                    .await?;
                return Ok((snapshot, HashSet::new()));
            }
        };

        let mut have_by_id: HashMap<String, Event> = HashMap::new();
        let mut have_event_ids: HashSet<String> = HashSet::new();
        for id_list in [&state_ids.state_event_ids, &state_ids.auth_event_ids] {
            let held = self.roomserver.query_events_by_id(id_list).await?;
            for headered in held {
                have_event_ids.insert(headered.event_id().to_string());
                have_by_id.insert(headered.event_id().to_string(), headered.event);
            }
        }

        let mut missing: Vec<String> = state_ids
            .state_event_ids
            .iter()
            .chain(&state_ids.auth_event_ids)
            .filter(|id| !have_by_id.contains_key(*id))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        info!(
            event_id = %event_id,
            room_id = %room_id,
            missing = missing.len(),
            already_have = have_by_id.len(),
            total_state = state_ids.state_event_ids.len(),
            total_auth_events = state_ids.auth_event_ids.len(),
            "Fetching missing state at event"
        );

        for missing_id in &missing {
            let fetched = self.lookup_event(room_version, missing_id).await?;
            have_by_id.insert(fetched.event.event_id.clone(), fetched.event);
        }

        let body_for = |id: &String| -> Result<Event, TxnError> {
            have_by_id.get(id).cloned().ok_or_else(|| {
                TxnError::InvalidStateSnapshot(format!("missing state event {id:?}"))
            })
        };
        let mut snapshot = StateSnapshot {
            state_events: state_ids
                .state_event_ids
                .iter()
                .map(body_for)
                .collect::<Result<_, _>>()?,
            auth_events: state_ids
                .auth_event_ids
                .iter()
                .map(body_for)
                .collect::<Result<_, _>>()?,
        };
        self.check_snapshot(&mut snapshot, room_version).await?;
        Ok((snapshot, have_event_ids))
    }

    /// Full-body `/state` fetch, used once per extremity when `/state_ids`
    /// is unavailable.
    pub(crate) async fn lookup_missing_state_via_state(
        &self,
        room_version: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<StateSnapshot, TxnError> {
        let mut snapshot = self
            .federation
            .lookup_state(&self.origin, room_id, event_id, room_version)
            .await?;
        self.check_snapshot(&mut snapshot, room_version).await?;
        Ok(snapshot)
    }

    /// Fetch one event over federation, parsing and signature-verifying it
    /// before use.
    pub(crate) async fn lookup_event(
        &self,
        room_version: &str,
        event_id: &str,
    ) -> Result<HeaderedEvent, TxnError> {
        let txn = self
            .federation
            .get_event(&self.origin, event_id)
            .await
            .map_err(|err| {
                warn!(event_id = %event_id, error = %err, "Failed to fetch missing event");
                TxnError::from(err)
            })?;
        let raw = txn.pdus.first().ok_or_else(|| {
            TxnError::Federation(FederationApiError::InvalidResponse(format!(
                "/event returned no PDUs for {event_id:?}"
            )))
        })?;
        let event = parse_untrusted(raw, room_version).map_err(TxnError::from)?;
        let headered = event.headered(room_version);
        self.verifier
            .verify_signatures(std::slice::from_ref(&headered))
            .await
            .map_err(TxnError::from)?;
        Ok(headered)
    }

    /// Integrity checks on an assembled snapshot: every auth reference must
    /// resolve within the snapshot and every event must carry a valid
    /// signature. Missing auth events are fetched by id and the check
    /// retried, bounded by the finite set of missing ids.
    pub(crate) async fn check_snapshot(
        &self,
        snapshot: &mut StateSnapshot,
        room_version: &str,
    ) -> Result<(), TxnError> {
        let mut fetched: HashSet<String> = HashSet::new();
        loop {
            match find_snapshot_issue(snapshot) {
                None => break,
                Some(SnapshotIssue::MissingAuthEvent(auth_id)) => {
                    if !fetched.insert(auth_id.clone()) {
                        return Err(TxnError::InvalidStateSnapshot(format!(
                            "auth event {auth_id:?} still missing after fetching it"
                        )));
                    }
                    debug!(auth_id = %auth_id, "Snapshot is missing an auth event, fetching it");
                    let event = self.lookup_event(room_version, &auth_id).await?;
                    snapshot.auth_events.push(event.event);
                }
            }
        }

        for event in snapshot.auth_events.iter().chain(&snapshot.state_events) {
            self.verifier
                .verify_event(event, room_version)
                .await
                .map_err(|err| TxnError::InvalidStateSnapshot(err.to_string()))?;
        }
        Ok(())
    }
}

fn find_snapshot_issue(snapshot: &StateSnapshot) -> Option<SnapshotIssue> {
    let known: HashSet<&str> = snapshot
        .auth_events
        .iter()
        .chain(&snapshot.state_events)
        .map(|e| e.event_id.as_str())
        .collect();
    for event in snapshot.state_events.iter().chain(&snapshot.auth_events) {
        for auth_id in event.auth_event_ids() {
            if !known.contains(auth_id.as_str()) {
                return Some(SnapshotIssue::MissingAuthEvent(auth_id.clone()));
            }
        }
    }
    None
}
