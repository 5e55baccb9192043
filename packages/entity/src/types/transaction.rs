use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::Edu;

/// Transaction - the envelope of a federation `send` request
///
/// PDUs are kept as raw JSON here: they cannot be parsed into typed events
/// until the room version is known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Server name of the sending homeserver
    pub origin: String,

    /// Timestamp the transaction was created on the origin, in milliseconds
    #[serde(default)]
    pub origin_server_ts: i64,

    /// Server name of the receiving homeserver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Opaque transaction identifier chosen by the origin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Room events, as received
    #[serde(default)]
    pub pdus: Vec<Value>,

    /// Ephemeral data units
    #[serde(default)]
    pub edus: Vec<Edu>,
}

/// The per-event outcome reported back to the sender: empty on success,
/// an error string when the event was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PduResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PduResult {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()) }
    }
}

/// Response body of `PUT /_matrix/federation/v1/send/{txnId}`.
///
/// A `BTreeMap` keeps serialization order deterministic for identical
/// inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub pdus: BTreeMap<String, PduResult>,
}

/// Parameters of a `/get_missing_events` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingEventsRequest {
    /// Maximum number of events to retrieve
    pub limit: usize,

    /// Floor on the depth of retrieved events
    pub min_depth: i64,

    /// Event IDs the caller already has; traversal stops at these
    pub earliest_events: Vec<String>,

    /// Event IDs whose ancestors are wanted
    pub latest_events: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissingEventsResponse {
    /// Events closing the gap, as raw JSON in no particular order
    #[serde(default)]
    pub events: Vec<Value>,
}
