//! Parsing and signature verification of untrusted events
//!
//! Everything a remote server hands us is hostile until it has been through
//! this module: parsed under the room's version, content-hash checked, and
//! signature-verified against pinned server keys. A parsed event has a
//! stable event id; re-parsing the same bytes yields the same id.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::Signature;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use fedrix_entity::types::{Event, HeaderedEvent};
use fedrix_entity::utils::canonical_json;

use crate::federation::keyring::ServerKeyRing;

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("{0}")]
    Unmarshal(String),

    #[error("event {event_id:?}: {cause}")]
    Signature { event_id: String, cause: String },
}

/// Parse an untrusted PDU into a typed event pinned to `room_version`.
///
/// For room versions 1-2 the event id is taken from the JSON; for version 3
/// and later it is computed from the redacted canonical form and any
/// client-supplied id is ignored. No network or database access.
pub fn parse_untrusted(raw: &Value, room_version: &str) -> Result<Event, VerifierError> {
    if !raw.is_object() {
        return Err(VerifierError::Unmarshal("event is not a JSON object".to_string()));
    }

    // Canonicalization also rejects non-integer numbers anywhere in the
    // event, which no room version permits.
    canonical_json(raw).map_err(|e| VerifierError::Unmarshal(e.to_string()))?;

    let mut event: Event = serde_json::from_value(raw.clone())
        .map_err(|e| VerifierError::Unmarshal(e.to_string()))?;

    validate_basic_format(&event)?;

    match room_version {
        "1" | "2" => {
            if event.event_id.is_empty() {
                return Err(VerifierError::Unmarshal(format!(
                    "room version {room_version} events must carry an event_id"
                )));
            }
            if !event.event_id.starts_with('$') {
                return Err(VerifierError::Unmarshal(format!(
                    "invalid event_id {:?}",
                    event.event_id
                )));
            }
        }
        _ => {
            event.event_id = compute_event_id(raw, room_version)?;
        }
    }

    if let Some(expected) = raw
        .get("hashes")
        .and_then(|h| h.get("sha256"))
        .and_then(Value::as_str)
    {
        let actual = content_hash(raw)?;
        if expected != actual {
            return Err(VerifierError::Unmarshal(format!(
                "content hash mismatch for event {:?}",
                event.event_id
            )));
        }
    }

    debug!(event_id = %event.event_id, room_version = %room_version, "Parsed untrusted event");
    Ok(event)
}

fn validate_basic_format(event: &Event) -> Result<(), VerifierError> {
    if !event.room_id.starts_with('!') {
        return Err(VerifierError::Unmarshal(format!("invalid room_id {:?}", event.room_id)));
    }
    if !event.sender.starts_with('@') || !event.sender.contains(':') {
        return Err(VerifierError::Unmarshal(format!("invalid sender {:?}", event.sender)));
    }
    if event.event_type.is_empty() {
        return Err(VerifierError::Unmarshal("event type cannot be empty".to_string()));
    }
    if event.depth.is_some_and(|d| d < 0) {
        return Err(VerifierError::Unmarshal("event depth cannot be negative".to_string()));
    }
    Ok(())
}

/// Apply the redaction algorithm: strip every key the room version does not
/// protect, at the top level and within `content`. Room versions with
/// computed event ids carry no `event_id` in the hashed form at all, so a
/// supplied one cannot influence the id.
pub fn redact_event(raw: &Value, room_version: &str) -> Value {
    const KEPT_TOP_LEVEL: &[&str] = &[
        "event_id",
        "type",
        "room_id",
        "sender",
        "state_key",
        "content",
        "hashes",
        "signatures",
        "depth",
        "prev_events",
        "auth_events",
        "origin",
        "origin_server_ts",
        "membership",
        "redacts",
    ];

    let Some(obj) = raw.as_object() else {
        return raw.clone();
    };

    let mut redacted = Map::new();
    for key in KEPT_TOP_LEVEL {
        if *key == "event_id" && !matches!(room_version, "1" | "2") {
            continue;
        }
        if let Some(value) = obj.get(*key) {
            redacted.insert((*key).to_string(), value.clone());
        }
    }

    let event_type = obj.get("type").and_then(Value::as_str).unwrap_or("");
    let kept_content: &[&str] = match event_type {
        "m.room.create" => &["creator", "room_version", "m.federate"],
        "m.room.member" => &["membership"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "invite",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.aliases" => &["aliases"],
        _ => &[],
    };

    let mut content = Map::new();
    if let Some(original) = obj.get("content").and_then(Value::as_object) {
        for key in kept_content {
            if let Some(value) = original.get(*key) {
                content.insert((*key).to_string(), value.clone());
            }
        }
    }
    redacted.insert("content".to_string(), Value::Object(content));

    Value::Object(redacted)
}

/// Canonical JSON of the redacted event with `signatures` and `unsigned`
/// removed: the exact bytes a server signs and a verifier checks.
pub fn signature_payload(raw: &Value, room_version: &str) -> Result<String, VerifierError> {
    let mut redacted = redact_event(raw, room_version);
    if let Some(obj) = redacted.as_object_mut() {
        obj.remove("signatures");
        obj.remove("unsigned");
    }
    canonical_json(&redacted).map_err(|e| VerifierError::Unmarshal(e.to_string()))
}

/// Event id for room versions 3 and later: a hash of the redacted canonical
/// form, so two equal ids imply equal events.
pub fn compute_event_id(raw: &Value, room_version: &str) -> Result<String, VerifierError> {
    let payload = signature_payload(raw, room_version)?;
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let hash = hasher.finalize();
    let encoded = match room_version {
        "3" => STANDARD_NO_PAD.encode(hash),
        _ => URL_SAFE_NO_PAD.encode(hash),
    };
    Ok(format!("${encoded}"))
}

/// SHA-256 over the canonical event without `hashes`, `signatures`, or
/// `unsigned`: the value carried in `hashes.sha256`. The redacted form a
/// server signs covers this hash, which is what makes unprotected content
/// tamper-evident.
pub fn content_hash(raw: &Value) -> Result<String, VerifierError> {
    let mut hashable = raw.clone();
    if let Some(obj) = hashable.as_object_mut() {
        obj.remove("hashes");
        obj.remove("signatures");
        obj.remove("unsigned");
    }
    let payload =
        canonical_json(&hashable).map_err(|e| VerifierError::Unmarshal(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    Ok(STANDARD_NO_PAD.encode(hasher.finalize()))
}

/// Verifies event signatures against keys supplied by the key ring.
#[derive(Clone)]
pub struct EventVerifier {
    key_ring: Arc<dyn ServerKeyRing>,
}

impl EventVerifier {
    pub fn new(key_ring: Arc<dyn ServerKeyRing>) -> Self {
        Self { key_ring }
    }

    /// Check that every required signing server has a valid signature on
    /// `event`. The sender's server must always have signed.
    pub async fn verify_event(
        &self,
        event: &Event,
        room_version: &str,
    ) -> Result<(), VerifierError> {
        let raw = serde_json::to_value(event)
            .map_err(|e| VerifierError::Unmarshal(e.to_string()))?;
        let payload = signature_payload(&raw, room_version)?;

        let required_server = event.sender_server().ok_or_else(|| VerifierError::Signature {
            event_id: event.event_id.clone(),
            cause: format!("sender {:?} has no server part", event.sender),
        })?;

        let server_sigs = event
            .signatures
            .as_ref()
            .and_then(|sigs| sigs.get(required_server))
            .ok_or_else(|| VerifierError::Signature {
                event_id: event.event_id.clone(),
                cause: format!("no signature from server {required_server:?}"),
            })?;

        for (key_id, sig_b64) in server_sigs {
            let verify_key = match self.key_ring.verify_key(required_server, key_id).await {
                Ok(key) => key,
                Err(err) => {
                    debug!(
                        server_name = %required_server,
                        key_id = %key_id,
                        error = %err,
                        "No verify key available, trying next signature"
                    );
                    continue;
                }
            };
            let Ok(sig_bytes) = decode_signature_b64(sig_b64) else {
                continue;
            };
            let Ok(signature) = Signature::from_slice(&sig_bytes) else {
                continue;
            };
            if verify_key.verify_strict(payload.as_bytes(), &signature).is_ok() {
                return Ok(());
            }
            warn!(
                event_id = %event.event_id,
                server_name = %required_server,
                key_id = %key_id,
                "Event signature did not verify"
            );
        }

        Err(VerifierError::Signature {
            event_id: event.event_id.clone(),
            cause: format!("no valid signature from server {required_server:?}"),
        })
    }

    /// Verify a batch of events, failing on the first bad one.
    pub async fn verify_signatures(
        &self,
        events: &[HeaderedEvent],
    ) -> Result<(), VerifierError> {
        for headered in events {
            self.verify_event(&headered.event, &headered.room_version).await?;
        }
        Ok(())
    }
}

fn decode_signature_b64(sig_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // Senders are inconsistent about padding.
    STANDARD_NO_PAD
        .decode(sig_b64.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(sig_b64))
}
