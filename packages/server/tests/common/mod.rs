//! Shared fixtures for federation ingress tests: fake collaborators and
//! signed-event builders driving the transaction processor.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fedrix_entity::types::{
    Edu, Event, HeaderedEvent, MissingEventsRequest, MissingEventsResponse, RemoteStateIds,
    StateSnapshot, StateTuple, Transaction,
};
use fedrix_server::federation::client::{FederationApi, FederationApiError};
use fedrix_server::federation::event_verifier::{content_hash, parse_untrusted, signature_payload};
use fedrix_server::federation::keyring::StaticKeyRing;
use fedrix_server::federation::producer::{
    EduProducer, OutputProducer, ProducerError, SendAsServer,
};
use fedrix_server::federation::roomserver::{
    LatestEventsResponse, RoomserverApi, RoomserverApiError, StateAfterEventsResponse,
};
use fedrix_server::federation::{TxnProcessor, TxnProcessorParams};

pub const ROOM: &str = "!r:a";
pub const ROOM_VERSION: &str = "2";
pub const LOCAL_SERVER: &str = "a";
pub const REMOTE_SERVER: &str = "b";

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn local_key() -> SigningKey {
    signing_key(7)
}

pub fn remote_key() -> SigningKey {
    signing_key(11)
}

fn key_for_server(server: &str) -> (SigningKey, &'static str) {
    match server {
        LOCAL_SERVER => (local_key(), "ed25519:a1"),
        _ => (remote_key(), "ed25519:b1"),
    }
}

/// Hash and sign `raw` the way its origin server would: content hash over
/// the full event, signature over the canonical JSON of the redacted
/// event (which covers the hash).
pub fn sign_event_json(raw: &mut Value, room_version: &str) {
    let sender = raw["sender"].as_str().expect("event has sender");
    let server = sender.split_once(':').expect("sender has server").1.to_string();
    let (key, key_id) = key_for_server(&server);
    raw["hashes"] = json!({"sha256": content_hash(raw).expect("hashable event")});
    let payload = signature_payload(raw, room_version).expect("signable event");
    let signature = key.sign(payload.as_bytes());
    let encoded = STANDARD_NO_PAD.encode(signature.to_bytes());
    raw["signatures"] = json!({ server: { key_id: encoded } });
}

/// Replace the event's signature with a well-formed but invalid one.
pub fn corrupt_signature(raw: &mut Value) {
    let sender = raw["sender"].as_str().expect("event has sender");
    let server = sender.split_once(':').expect("sender has server").1.to_string();
    let (_, key_id) = key_for_server(&server);
    raw["signatures"] = json!({ server: { key_id: STANDARD_NO_PAD.encode([0u8; 64]) } });
}

pub struct EventSpec<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub sender: &'a str,
    pub state_key: Option<&'a str>,
    pub content: Value,
    pub prev_events: &'a [&'a str],
    pub auth_events: &'a [&'a str],
    pub depth: i64,
}

pub fn signed_event(spec: EventSpec<'_>) -> Value {
    let mut raw = json!({
        "event_id": spec.event_id,
        "type": spec.event_type,
        "room_id": ROOM,
        "sender": spec.sender,
        "origin_server_ts": 1_700_000_000_000_i64 + spec.depth,
        "content": spec.content,
        "prev_events": spec.prev_events,
        "auth_events": spec.auth_events,
        "depth": spec.depth,
    });
    if let Some(state_key) = spec.state_key {
        raw["state_key"] = json!(state_key);
    }
    sign_event_json(&mut raw, ROOM_VERSION);
    raw
}

pub fn parse_fixture(raw: &Value) -> HeaderedEvent {
    parse_untrusted(raw, ROOM_VERSION)
        .expect("fixture parses")
        .headered(ROOM_VERSION)
}

pub fn key_ring() -> StaticKeyRing {
    let mut ring = StaticKeyRing::new();
    ring.insert(LOCAL_SERVER, "ed25519:a1", local_key().verifying_key());
    ring.insert(REMOTE_SERVER, "ed25519:b1", remote_key().verifying_key());
    ring
}

#[derive(Default)]
pub struct FakeRoomserver {
    pub versions: HashMap<String, String>,
    pub known: Arc<Mutex<HashSet<String>>>,
    pub room_state: HashMap<String, Vec<HeaderedEvent>>,
    pub bodies: HashMap<String, HeaderedEvent>,
    pub latest: HashMap<String, (Vec<String>, i64)>,
}

#[async_trait]
impl RoomserverApi for FakeRoomserver {
    async fn query_room_version_for_room(
        &self,
        room_id: &str,
    ) -> Result<String, RoomserverApiError> {
        self.versions
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomserverApiError::NotFound(room_id.to_string()))
    }

    async fn query_state_after_events(
        &self,
        room_id: &str,
        prev_event_ids: &[String],
        _state_wanted: Option<&[StateTuple]>,
    ) -> Result<StateAfterEventsResponse, RoomserverApiError> {
        let room_exists = self.versions.contains_key(room_id);
        let known = self.known.lock().unwrap();
        let prev_events_exist = prev_event_ids.iter().all(|id| known.contains(id));
        Ok(StateAfterEventsResponse {
            room_exists,
            prev_events_exist,
            room_version: self.versions.get(room_id).cloned().unwrap_or_default(),
            state_events: if prev_events_exist {
                self.room_state.get(room_id).cloned().unwrap_or_default()
            } else {
                Vec::new()
            },
        })
    }

    async fn query_events_by_id(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<HeaderedEvent>, RoomserverApiError> {
        Ok(event_ids
            .iter()
            .filter_map(|id| self.bodies.get(id).cloned())
            .collect())
    }

    async fn query_latest_events_and_state(
        &self,
        room_id: &str,
        _state_wanted: &[StateTuple],
    ) -> Result<LatestEventsResponse, RoomserverApiError> {
        let (latest_events, depth) = self
            .latest
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomserverApiError::NotFound(room_id.to_string()))?;
        Ok(LatestEventsResponse {
            latest_events,
            depth,
            state_events: self.room_state.get(room_id).cloned().unwrap_or_default(),
        })
    }
}

#[derive(Default)]
pub struct FakeFederation {
    /// `Ok` events for `/get_missing_events`, or `Err` to simulate a
    /// refusing sender. Unset means the endpoint is unexpected.
    pub missing_events: Option<Result<Vec<Value>, String>>,
    pub state_ids: HashMap<String, RemoteStateIds>,
    pub state: HashMap<String, StateSnapshot>,
    pub events: HashMap<String, Value>,
    pub missing_events_calls: AtomicUsize,
    pub get_event_calls: AtomicUsize,
    /// Cancelled as a side effect of the first `/event` fetch, simulating
    /// a client disconnect late in gap recovery.
    pub cancel_on_get_event: Option<CancellationToken>,
}

#[async_trait]
impl FederationApi for FakeFederation {
    async fn lookup_state(
        &self,
        _server_name: &str,
        _room_id: &str,
        event_id: &str,
        _room_version: &str,
    ) -> Result<StateSnapshot, FederationApiError> {
        self.state.get(event_id).cloned().ok_or_else(|| {
            FederationApiError::ServerError {
                status_code: 404,
                message: format!("no /state for {event_id}"),
            }
        })
    }

    async fn lookup_state_ids(
        &self,
        _server_name: &str,
        _room_id: &str,
        event_id: &str,
    ) -> Result<RemoteStateIds, FederationApiError> {
        self.state_ids.get(event_id).cloned().ok_or_else(|| {
            FederationApiError::ServerError {
                status_code: 404,
                message: format!("no /state_ids for {event_id}"),
            }
        })
    }

    async fn get_event(
        &self,
        _server_name: &str,
        event_id: &str,
    ) -> Result<Transaction, FederationApiError> {
        self.get_event_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_get_event {
            token.cancel();
        }
        let raw = self.events.get(event_id).ok_or_else(|| {
            FederationApiError::ServerError {
                status_code: 404,
                message: format!("no /event for {event_id}"),
            }
        })?;
        Ok(Transaction {
            origin: REMOTE_SERVER.to_string(),
            origin_server_ts: 0,
            destination: None,
            transaction_id: None,
            pdus: vec![raw.clone()],
            edus: Vec::new(),
        })
    }

    async fn lookup_missing_events(
        &self,
        _server_name: &str,
        _room_id: &str,
        _request: &MissingEventsRequest,
        _room_version: &str,
    ) -> Result<MissingEventsResponse, FederationApiError> {
        self.missing_events_calls.fetch_add(1, Ordering::SeqCst);
        match &self.missing_events {
            Some(Ok(events)) => Ok(MissingEventsResponse { events: events.clone() }),
            Some(Err(message)) => Err(FederationApiError::Http(message.clone())),
            None => Err(FederationApiError::ServerError {
                status_code: 404,
                message: "unexpected /get_missing_events".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentWithState {
    pub event_id: String,
    pub state_event_ids: Vec<String>,
    pub have_event_ids: HashSet<String>,
}

#[derive(Default)]
pub struct FakeProducer {
    pub known: Arc<Mutex<HashSet<String>>>,
    pub sent: Mutex<Vec<Vec<String>>>,
    pub sent_with_state: Mutex<Vec<SentWithState>>,
    pub next_position: AtomicI64,
}

#[async_trait]
impl OutputProducer for FakeProducer {
    async fn send_events(
        &self,
        events: &[HeaderedEvent],
        _send_as_server: SendAsServer,
        _transaction_id: Option<&str>,
    ) -> Result<Vec<i64>, ProducerError> {
        let ids: Vec<String> = events.iter().map(|e| e.event_id().to_string()).collect();
        {
            let mut known = self.known.lock().unwrap();
            for id in &ids {
                known.insert(id.clone());
            }
        }
        self.sent.lock().unwrap().push(ids);
        Ok(events
            .iter()
            .map(|_| self.next_position.fetch_add(1, Ordering::SeqCst))
            .collect())
    }

    async fn send_event_with_state(
        &self,
        state: &StateSnapshot,
        event: &HeaderedEvent,
        have_event_ids: &HashSet<String>,
    ) -> Result<(), ProducerError> {
        {
            let mut known = self.known.lock().unwrap();
            known.insert(event.event_id().to_string());
            for state_event in &state.state_events {
                known.insert(state_event.event_id.clone());
            }
        }
        self.sent_with_state.lock().unwrap().push(SentWithState {
            event_id: event.event_id().to_string(),
            state_event_ids: state.state_events.iter().map(|e| e.event_id.clone()).collect(),
            have_event_ids: have_event_ids.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEduProducer {
    pub typing: Mutex<Vec<(String, String, bool, i64)>>,
}

#[async_trait]
impl EduProducer for FakeEduProducer {
    async fn send_typing(
        &self,
        user_id: &str,
        room_id: &str,
        typing: bool,
        timeout_ms: i64,
    ) -> Result<(), ProducerError> {
        self.typing.lock().unwrap().push((
            user_id.to_string(),
            room_id.to_string(),
            typing,
            timeout_ms,
        ));
        Ok(())
    }
}

pub struct Harness {
    pub roomserver: Arc<FakeRoomserver>,
    pub federation: Arc<FakeFederation>,
    pub producer: Arc<FakeProducer>,
    pub edu_producer: Arc<FakeEduProducer>,
    pub request_token: CancellationToken,
    pub shutdown_token: CancellationToken,
    pub processor: TxnProcessor,
}

impl Harness {
    pub fn new(roomserver: FakeRoomserver, federation: FakeFederation) -> Self {
        Self::with_request_token(roomserver, federation, CancellationToken::new())
    }

    pub fn with_request_token(
        roomserver: FakeRoomserver,
        federation: FakeFederation,
        request_token: CancellationToken,
    ) -> Self {
        let known = roomserver.known.clone();
        let roomserver = Arc::new(roomserver);
        let federation = Arc::new(federation);
        let producer = Arc::new(FakeProducer {
            known,
            ..FakeProducer::default()
        });
        let edu_producer = Arc::new(FakeEduProducer::default());
        let shutdown_token = CancellationToken::new();

        let processor = TxnProcessor::new(TxnProcessorParams {
            origin: REMOTE_SERVER.to_string(),
            transaction_id: Some("txn1".to_string()),
            roomserver: roomserver.clone(),
            federation: federation.clone(),
            producer: producer.clone(),
            edu_producer: edu_producer.clone(),
            key_ring: Arc::new(key_ring()),
            request_token: request_token.clone(),
            shutdown_token: shutdown_token.clone(),
        });

        Self {
            roomserver,
            federation,
            producer,
            edu_producer,
            request_token,
            shutdown_token,
            processor,
        }
    }

    pub fn sent_batches(&self) -> Vec<Vec<String>> {
        self.producer.sent.lock().unwrap().clone()
    }

    pub fn sent_with_state(&self) -> Vec<SentWithState> {
        self.producer.sent_with_state.lock().unwrap().clone()
    }
}

/// The standing fixture: room `!r:a` at version 2 with a creator on the
/// local server, remote user `@u:b` joined, and one known forward
/// extremity `$p0:a`.
pub struct RoomFixture {
    pub create: Value,
    pub admin_member: Value,
    pub remote_member: Value,
    pub prior_event: Value,
}

impl RoomFixture {
    pub fn new() -> Self {
        let create = signed_event(EventSpec {
            event_id: "$c:a",
            event_type: "m.room.create",
            sender: "@admin:a",
            state_key: Some(""),
            content: json!({"creator": "@admin:a", "room_version": ROOM_VERSION}),
            prev_events: &[],
            auth_events: &[],
            depth: 1,
        });
        let admin_member = signed_event(EventSpec {
            event_id: "$adm:a",
            event_type: "m.room.member",
            sender: "@admin:a",
            state_key: Some("@admin:a"),
            content: json!({"membership": "join"}),
            prev_events: &["$c:a"],
            auth_events: &["$c:a"],
            depth: 2,
        });
        let remote_member = signed_event(EventSpec {
            event_id: "$m:a",
            event_type: "m.room.member",
            sender: "@u:b",
            state_key: Some("@u:b"),
            content: json!({"membership": "join"}),
            prev_events: &["$adm:a"],
            auth_events: &["$c:a"],
            depth: 3,
        });
        let prior_event = signed_event(EventSpec {
            event_id: "$p0:a",
            event_type: "m.room.message",
            sender: "@admin:a",
            state_key: None,
            content: json!({"msgtype": "m.text", "body": "welcome"}),
            prev_events: &["$m:a"],
            auth_events: &["$c:a"],
            depth: 4,
        });
        Self {
            create,
            admin_member,
            remote_member,
            prior_event,
        }
    }

    pub fn state_events(&self) -> Vec<HeaderedEvent> {
        vec![
            parse_fixture(&self.create),
            parse_fixture(&self.admin_member),
            parse_fixture(&self.remote_member),
        ]
    }

    pub fn roomserver(&self) -> FakeRoomserver {
        let mut roomserver = FakeRoomserver::default();
        roomserver
            .versions
            .insert(ROOM.to_string(), ROOM_VERSION.to_string());
        let known: HashSet<String> =
            ["$c:a", "$adm:a", "$m:a", "$p0:a"].iter().map(|s| s.to_string()).collect();
        roomserver.known = Arc::new(Mutex::new(known));
        roomserver
            .room_state
            .insert(ROOM.to_string(), self.state_events());
        for raw in [&self.create, &self.admin_member, &self.remote_member, &self.prior_event] {
            let headered = parse_fixture(raw);
            roomserver.bodies.insert(headered.event_id().to_string(), headered);
        }
        roomserver
            .latest
            .insert(ROOM.to_string(), (vec!["$p0:a".to_string()], 4));
        roomserver
    }
}

pub fn transaction(pdus: Vec<Value>, edus: Vec<Edu>) -> Transaction {
    Transaction {
        origin: REMOTE_SERVER.to_string(),
        origin_server_ts: 1_700_000_000_000,
        destination: Some(LOCAL_SERVER.to_string()),
        transaction_id: Some("txn1".to_string()),
        pdus,
        edus,
    }
}

pub fn typing_edu(user_id: &str, room_id: &str, typing: bool) -> Edu {
    Edu {
        edu_type: "m.typing".to_string(),
        content: json!({"room_id": room_id, "user_id": user_id, "typing": typing}),
    }
}

/// Convenience for asserting a state event body equals an entity Event.
pub fn entity_event(raw: &Value) -> Event {
    parse_fixture(raw).event
}
