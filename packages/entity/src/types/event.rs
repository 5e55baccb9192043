use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Event - Matrix spec compliant PDU (Persistent Data Unit)
///
/// The shape of a room event as replicated over federation. Events arrive
/// untrusted; `fedrix_server::federation::event_verifier` is the only place
/// that may construct one from remote bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier. Computed from the redacted canonical form
    /// for room versions 3 and later; carried explicitly in versions 1-2.
    #[serde(default)]
    pub event_id: String,

    /// Event sender user ID
    pub sender: String,

    /// Origin server timestamp in milliseconds
    pub origin_server_ts: i64,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Room this event belongs to
    pub room_id: String,

    /// Event content
    pub content: Value,

    /// State key for state events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Unsigned event metadata, never covered by signatures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,

    /// Authorization events that give the sender permission to send this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_events: Option<Vec<String>>,

    /// Depth in the event DAG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,

    /// Content hashes for verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashMap<String, String>>,

    /// Previous events in the DAG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_events: Option<Vec<String>>,

    /// Digital signatures, keyed by server name then key ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<HashMap<String, HashMap<String, String>>>,

    /// Event ID that this event redacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

impl Event {
    pub fn prev_event_ids(&self) -> &[String] {
        self.prev_events.as_deref().unwrap_or(&[])
    }

    pub fn auth_event_ids(&self) -> &[String] {
        self.auth_events.as_deref().unwrap_or(&[])
    }

    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// The server name portion of the sender, e.g. `b` for `@u:b`.
    pub fn sender_server(&self) -> Option<&str> {
        self.sender.split_once(':').map(|(_, server)| server)
    }

    /// Pin this event to the room version it was parsed under.
    pub fn headered(self, room_version: &str) -> HeaderedEvent {
        HeaderedEvent {
            room_version: room_version.to_string(),
            event: self,
        }
    }
}

/// An [`Event`] wrapped together with the room-version tag it was parsed
/// under, so later redaction and hashing use the same rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderedEvent {
    pub room_version: String,
    pub event: Event,
}

impl HeaderedEvent {
    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn room_id(&self) -> &str {
        &self.event.room_id
    }
}
