use serde::{Deserialize, Serialize};

use super::Event;

/// A `(type, state_key)` pair identifying one slot of room state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateTuple {
    pub event_type: String,
    pub state_key: String,
}

impl StateTuple {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

/// A snapshot of room state at some point in the DAG: the state events
/// themselves plus the auth events needed to validate them.
///
/// This is both the shape returned by the remote `/state` endpoint and the
/// payload handed to the output producer after gap recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub auth_events: Vec<Event>,
    #[serde(default)]
    pub state_events: Vec<Event>,
}

/// Response of the remote `/state_ids` endpoint: event IDs only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteStateIds {
    #[serde(default)]
    pub auth_event_ids: Vec<String>,
    #[serde(default)]
    pub state_event_ids: Vec<String>,
}
