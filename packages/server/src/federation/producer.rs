//! Output producer: the seam between the ingress core and downstream
//! consumers
//!
//! Accepted events leave the core through [`OutputProducer`]; typing
//! notifications leave through [`EduProducer`]. The bundled [`BusProducer`]
//! publishes JSON messages keyed by room id onto an in-process channel and
//! assigns stream/topological positions as it goes.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use fedrix_entity::types::{HeaderedEvent, StateSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to serialize output event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("output bus closed")]
    BusClosed,
}

/// Controls whether the room-server should relay the event onward.
/// Inbound federation events are never re-sent to other servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendAsServer {
    DoNotSendToOtherServers,
    Server(String),
}

#[async_trait]
pub trait OutputProducer: Send + Sync {
    /// Hand off events whose prior state is already known locally.
    /// Returns the stream position written for each event, in order.
    async fn send_events(
        &self,
        events: &[HeaderedEvent],
        send_as_server: SendAsServer,
        transaction_id: Option<&str>,
    ) -> Result<Vec<i64>, ProducerError>;

    /// Hand off an event together with the resolved state snapshot at its
    /// backwards extremity. `have_event_ids` names the snapshot events the
    /// local server already holds so the consumer can skip rewriting them.
    /// The snapshot and the event are applied atomically.
    async fn send_event_with_state(
        &self,
        state: &StateSnapshot,
        event: &HeaderedEvent,
        have_event_ids: &HashSet<String>,
    ) -> Result<(), ProducerError>;
}

#[async_trait]
pub trait EduProducer: Send + Sync {
    async fn send_typing(
        &self,
        user_id: &str,
        room_id: &str,
        typing: bool,
        timeout_ms: i64,
    ) -> Result<(), ProducerError>;
}

/// A message on the downstream bus, keyed by room id.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub room_id: String,
    pub payload: Vec<u8>,
}

/// The JSON body of a room-event bus message.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutputEvent {
    pub event: HeaderedEvent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    pub send_as_server: SendAsServer,

    /// Event ids of a state snapshot delivered alongside the event,
    /// excluding those the server already had.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adds_state_event_ids: Vec<String>,
}

/// The JSON body of a typing bus message.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutputTyping {
    pub room_id: String,
    pub user_id: String,
    pub typing: bool,
    pub expire_after_ms: i64,
}

/// Maps event ids to their `(topological_position, stream_position)` pair.
/// Insertion is idempotent keyed on event id: replaying an event keeps the
/// position it was first given.
#[derive(Debug, Default)]
pub struct TopologyTable {
    positions: HashMap<String, (i64, i64)>,
    next_stream_position: i64,
}

impl TopologyTable {
    pub fn insert(&mut self, event_id: &str, depth: i64) -> (i64, i64) {
        if let Some(position) = self.positions.get(event_id) {
            return *position;
        }
        self.next_stream_position += 1;
        let position = (depth, self.next_stream_position);
        self.positions.insert(event_id.to_string(), position);
        position
    }

    pub fn position_of(&self, event_id: &str) -> Option<(i64, i64)> {
        self.positions.get(event_id).copied()
    }

    /// Event ids whose topological position lies in `[min_depth, max_depth]`,
    /// ordered by position.
    pub fn event_ids_in_range(&self, min_depth: i64, max_depth: i64) -> Vec<String> {
        let mut hits: Vec<(&String, (i64, i64))> = self
            .positions
            .iter()
            .filter(|(_, (depth, _))| *depth >= min_depth && *depth <= max_depth)
            .map(|(id, pos)| (id, *pos))
            .collect();
        hits.sort_by_key(|(_, pos)| *pos);
        hits.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

/// In-process output producer publishing to an unbounded channel.
pub struct BusProducer {
    sender: mpsc::UnboundedSender<BusMessage>,
    topology: Mutex<TopologyTable>,
}

impl BusProducer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                topology: Mutex::new(TopologyTable::default()),
            },
            receiver,
        )
    }

    fn publish(&self, room_id: &str, payload: Vec<u8>) -> Result<(), ProducerError> {
        self.sender
            .send(BusMessage {
                room_id: room_id.to_string(),
                payload,
            })
            .map_err(|_| ProducerError::BusClosed)
    }

    fn record_position(&self, event: &HeaderedEvent) -> i64 {
        let depth = event.event.depth.unwrap_or(0);
        let mut topology = self.topology.lock().expect("topology lock poisoned");
        let (_, stream) = topology.insert(event.event_id(), depth);
        stream
    }

    pub fn position_of(&self, event_id: &str) -> Option<(i64, i64)> {
        self.topology.lock().expect("topology lock poisoned").position_of(event_id)
    }
}

#[async_trait]
impl OutputProducer for BusProducer {
    async fn send_events(
        &self,
        events: &[HeaderedEvent],
        send_as_server: SendAsServer,
        transaction_id: Option<&str>,
    ) -> Result<Vec<i64>, ProducerError> {
        let mut positions = Vec::with_capacity(events.len());
        for event in events {
            let stream = self.record_position(event);
            let output = OutputEvent {
                event: event.clone(),
                transaction_id: transaction_id.map(str::to_string),
                send_as_server: send_as_server.clone(),
                adds_state_event_ids: Vec::new(),
            };
            self.publish(event.room_id(), serde_json::to_vec(&output)?)?;
            debug!(event_id = %event.event_id(), stream_position = stream, "Produced room event");
            positions.push(stream);
        }
        Ok(positions)
    }

    async fn send_event_with_state(
        &self,
        state: &StateSnapshot,
        event: &HeaderedEvent,
        have_event_ids: &HashSet<String>,
    ) -> Result<(), ProducerError> {
        let adds_state_event_ids: Vec<String> = state
            .state_events
            .iter()
            .map(|e| e.event_id.clone())
            .filter(|id| !have_event_ids.contains(id))
            .collect();

        let stream = self.record_position(event);
        let output = OutputEvent {
            event: event.clone(),
            transaction_id: None,
            send_as_server: SendAsServer::DoNotSendToOtherServers,
            adds_state_event_ids,
        };
        self.publish(event.room_id(), serde_json::to_vec(&output)?)?;
        info!(
            event_id = %event.event_id(),
            stream_position = stream,
            state_events = state.state_events.len(),
            "Produced room event with state snapshot"
        );
        Ok(())
    }
}

#[async_trait]
impl EduProducer for BusProducer {
    async fn send_typing(
        &self,
        user_id: &str,
        room_id: &str,
        typing: bool,
        timeout_ms: i64,
    ) -> Result<(), ProducerError> {
        let output = OutputTyping {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            typing,
            expire_after_ms: timeout_ms,
        };
        self.publish(room_id, serde_json::to_vec(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_insert_is_idempotent() {
        let mut topology = TopologyTable::default();
        let first = topology.insert("$e1:a", 4);
        let second = topology.insert("$e1:a", 4);
        assert_eq!(first, second);
        assert_eq!(topology.position_of("$e1:a"), Some(first));
    }

    #[test]
    fn topology_assigns_increasing_stream_positions() {
        let mut topology = TopologyTable::default();
        let (_, s1) = topology.insert("$e1:a", 1);
        let (_, s2) = topology.insert("$e2:a", 2);
        assert!(s2 > s1);
    }

    #[test]
    fn topology_range_is_ordered_by_position() {
        let mut topology = TopologyTable::default();
        topology.insert("$e1:a", 1);
        topology.insert("$e3:a", 3);
        topology.insert("$e2:a", 2);
        assert_eq!(
            topology.event_ids_in_range(2, 3),
            vec!["$e2:a".to_string(), "$e3:a".to_string()]
        );
    }
}
