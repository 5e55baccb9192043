//! Gap recovery via `/get_missing_events`
//!
//! When an event arrives whose prev_events we do not hold, the sender is
//! asked for the intermediate events. The fetch is bounded (limit and
//! depth window) and only ever happens for events delivered directly in a
//! transaction: recursing from here runs with `is_inbound_txn = false`,
//! which on a further gap takes a state snapshot instead of fetching
//! again. A transaction can therefore never be weaponized into unbounded
//! remote fetching.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use fedrix_entity::types::{Event, HeaderedEvent, MissingEventsRequest};

use crate::federation::auth::state_needed_for_auth;
use crate::federation::error::TxnError;
use crate::federation::event_verifier::parse_untrusted;
use crate::federation::transaction::{EventOutcome, TxnProcessor};

const MISSING_EVENTS_LIMIT: usize = 20;
const MISSING_EVENTS_DEPTH_WINDOW: i64 = 20;

impl TxnProcessor {
    /// Entered when prev_events are missing for an inbound event. Either
    /// the gap gets filled completely, or a backwards extremity is
    /// established and the event is handed off with a state snapshot.
    pub(crate) async fn process_event_with_missing_state(
        &self,
        event: &HeaderedEvent,
    ) -> Result<(), TxnError> {
        match self.get_missing_events(event).await? {
            None => Ok(()),
            Some(extremity) => self.resolve_and_send_with_state(event, &extremity).await,
        }
    }

    /// Ask the sender for the events between our forward extremities and
    /// `event`. Returns `None` when the gap was closed and `event` has been
    /// processed, or the backwards extremity a state snapshot should be
    /// taken at.
    pub(crate) async fn get_missing_events(
        &self,
        event: &HeaderedEvent,
    ) -> Result<Option<HeaderedEvent>, TxnError> {
        let room_version = event.room_version.clone();
        let needed = state_needed_for_auth(&event.event);

        let latest = match self
            .roomserver
            .query_latest_events_and_state(event.room_id(), &needed)
            .await
        {
            Ok(latest) => latest,
            Err(err) => {
                warn!(
                    event_id = %event.event_id(),
                    error = %err,
                    "Failed to query latest events, taking state snapshot instead"
                );
                return Ok(Some(event.clone()));
            }
        };
        self.ensure_active()?;

        let request = MissingEventsRequest {
            limit: MISSING_EVENTS_LIMIT,
            min_depth: latest.depth - MISSING_EVENTS_DEPTH_WINDOW,
            earliest_events: latest.latest_events,
            latest_events: vec![event.event_id().to_string()],
        };
        let missing = match self
            .federation
            .lookup_missing_events(&self.origin, event.room_id(), &request, &room_version)
            .await
        {
            Ok(missing) => missing,
            Err(err) => {
                // The sender pushed us this event but will not explain its
                // ancestry. Dropping the event here closes the hole a
                // malicious peer could use to install forged state.
                warn!(
                    origin = %self.origin,
                    event_id = %event.event_id(),
                    error = %err,
                    "Sender could not supply prev_events via /get_missing_events, dropping event"
                );
                return Err(TxnError::MissingPrevEvents {
                    event_id: event.event_id().to_string(),
                    cause: err.to_string(),
                });
            }
        };
        info!(
            event_id = %event.event_id(),
            returned = missing.events.len(),
            "/get_missing_events returned events"
        );

        // Verify everything the sender returned before trusting the batch
        // for ordering. One bad event drops the whole batch: a partial
        // history is worse than none.
        let mut fetched: Vec<Event> = Vec::with_capacity(missing.events.len());
        for raw in &missing.events {
            let headered = match parse_untrusted(raw, &room_version) {
                Ok(parsed) => parsed.headered(&room_version),
                Err(err) => {
                    return Err(TxnError::MissingPrevEvents {
                        event_id: event.event_id().to_string(),
                        cause: format!("returned event failed to parse: {err}"),
                    });
                }
            };
            if let Err(err) = self
                .verifier
                .verify_signatures(std::slice::from_ref(&headered))
                .await
            {
                return Err(TxnError::MissingPrevEvents {
                    event_id: event.event_id().to_string(),
                    cause: format!("returned event failed signature checks: {err}"),
                });
            }
            fetched.push(headered.event);
        }

        let has_prev_event = event
            .event
            .prev_event_ids()
            .iter()
            .any(|prev| fetched.iter().any(|ev| &ev.event_id == prev));
        if !has_prev_event {
            warn!(
                origin = %self.origin,
                event_id = %event.event_id(),
                "/get_missing_events returned none of the missing prev_events, dropping event"
            );
            return Err(TxnError::MissingPrevEvents {
                event_id: event.event_id().to_string(),
                cause: format!(
                    "server {:?} did not return any prev_events with IDs {:?}",
                    self.origin,
                    event.event.prev_event_ids()
                ),
            });
        }

        // Ancestors first, then the event which started all this.
        for missing_event in reverse_topological_ordering(fetched) {
            match self
                .process_event_inner(missing_event.headered(&room_version), false)
                .await?
            {
                EventOutcome::Processed => {}
                EventOutcome::BackwardsExtremity(extremity) => return Ok(Some(extremity)),
            }
        }
        match self.process_event_inner(event.clone(), false).await? {
            EventOutcome::Processed => Ok(None),
            EventOutcome::BackwardsExtremity(extremity) => Ok(Some(extremity)),
        }
    }

    /// Compute the room state after `extremity` and hand `event` off with
    /// it. The handoff deliberately ignores the request token: by now the
    /// resolved state is too expensive to discard over a dropped
    /// connection, so only process shutdown can stop it.
    pub(crate) async fn resolve_and_send_with_state(
        &self,
        event: &HeaderedEvent,
        extremity: &HeaderedEvent,
    ) -> Result<(), TxnError> {
        let (snapshot, have_event_ids) = self.lookup_state_after_event(extremity).await?;
        debug!(
            event_id = %event.event_id(),
            extremity = %extremity.event_id(),
            state_events = snapshot.state_events.len(),
            "Resolved state at backwards extremity"
        );

        if self.shutdown_token.is_cancelled() {
            return Err(TxnError::Cancelled);
        }
        self.producer
            .send_event_with_state(&snapshot, event, &have_event_ids)
            .await?;
        Ok(())
    }
}

/// Order events so that every event comes after all of its prev_events
/// that are present in the set. Ties are broken by depth then event id,
/// keeping the order deterministic for identical inputs.
pub fn reverse_topological_ordering(events: Vec<Event>) -> Vec<Event> {
    let ids: HashSet<String> = events.iter().map(|e| e.event_id.clone()).collect();

    let mut indegree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for event in &events {
        let within_set = event
            .prev_event_ids()
            .iter()
            .filter(|prev| ids.contains(*prev))
            .count();
        indegree.insert(event.event_id.clone(), within_set);
        for prev in event.prev_event_ids() {
            if ids.contains(prev) {
                dependents
                    .entry(prev.clone())
                    .or_default()
                    .push(event.event_id.clone());
            }
        }
    }

    let mut by_id: HashMap<String, Event> =
        events.into_iter().map(|e| (e.event_id.clone(), e)).collect();

    let mut ready: Vec<String> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let sort_key = |by_id: &HashMap<String, Event>, id: &String| {
        (by_id.get(id).and_then(|e| e.depth).unwrap_or(0), id.clone())
    };
    ready.sort_by_key(|id| sort_key(&by_id, id));

    let mut ordered = Vec::with_capacity(by_id.len());
    while let Some(id) = ready.first().cloned() {
        ready.remove(0);
        for dependent in dependents.remove(&id).unwrap_or_default() {
            if let Some(degree) = indegree.get_mut(&dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }
        ready.sort_by_key(|id| sort_key(&by_id, id));
        if let Some(event) = by_id.remove(&id) {
            ordered.push(event);
        }
    }

    // Anything left is part of a cycle, which a valid DAG cannot contain;
    // append in a stable order rather than dropping events silently.
    if !by_id.is_empty() {
        let mut rest: Vec<Event> = by_id.into_values().collect();
        rest.sort_by_key(|e| (e.depth.unwrap_or(0), e.event_id.clone()));
        ordered.extend(rest);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_id: &str, depth: i64, prev: &[&str]) -> Event {
        Event {
            event_id: event_id.to_string(),
            sender: "@u:a".to_string(),
            origin_server_ts: depth,
            event_type: "m.room.message".to_string(),
            room_id: "!r:a".to_string(),
            content: serde_json::json!({}),
            state_key: None,
            unsigned: None,
            auth_events: None,
            depth: Some(depth),
            hashes: None,
            prev_events: Some(prev.iter().map(|p| p.to_string()).collect()),
            signatures: None,
            redacts: None,
        }
    }

    #[test]
    fn ancestors_come_first() {
        let events = vec![
            event("$c:a", 3, &["$b:a"]),
            event("$a:a", 1, &["$root:a"]),
            event("$b:a", 2, &["$a:a"]),
        ];
        let ordered = reverse_topological_ordering(events);
        let ids: Vec<&str> = ordered.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$a:a", "$b:a", "$c:a"]);
    }

    #[test]
    fn branches_are_ordered_deterministically() {
        let forward = vec![
            event("$a:a", 1, &[]),
            event("$b1:a", 2, &["$a:a"]),
            event("$b2:a", 2, &["$a:a"]),
            event("$c:a", 3, &["$b1:a", "$b2:a"]),
        ];
        let reversed: Vec<Event> = forward.iter().rev().cloned().collect();
        let ordered_forward: Vec<String> = reverse_topological_ordering(forward)
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        let ordered_reversed: Vec<String> = reverse_topological_ordering(reversed)
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ordered_forward, ordered_reversed);
        assert_eq!(ordered_forward.last().map(String::as_str), Some("$c:a"));
    }

    #[test]
    fn external_prev_events_do_not_block_ordering() {
        let events = vec![event("$x:a", 9, &["$unknown:b"])];
        let ordered = reverse_topological_ordering(events);
        assert_eq!(ordered.len(), 1);
    }
}
