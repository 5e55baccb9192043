//! Room-server internal API
//!
//! Local queries about rooms we already hold: room versions, state after a
//! set of events, event bodies, forward extremities. The room-server owns
//! all persistence; this module only defines the query contract and an
//! HTTP adapter for a room-server running as a separate process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fedrix_entity::types::{HeaderedEvent, StateTuple};

#[derive(Debug, thiserror::Error)]
pub enum RoomserverApiError {
    #[error("room {0:?} not known to this server")]
    NotFound(String),

    #[error("room server transport failed: {0}")]
    Transport(String),

    #[error("room server rejected query: {0}")]
    Internal(String),
}

/// Response of [`RoomserverApi::query_state_after_events`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateAfterEventsResponse {
    /// Whether this server knows the room at all
    pub room_exists: bool,

    /// True iff the server holds every requested prev event
    pub prev_events_exist: bool,

    pub room_version: String,

    /// The requested state tuples after the prev events, when held
    #[serde(default)]
    pub state_events: Vec<HeaderedEvent>,
}

/// Response of [`RoomserverApi::query_latest_events_and_state`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestEventsResponse {
    /// Current forward extremities of the room
    pub latest_events: Vec<String>,

    /// Depth of the deepest forward extremity
    pub depth: i64,

    #[serde(default)]
    pub state_events: Vec<HeaderedEvent>,
}

#[async_trait]
pub trait RoomserverApi: Send + Sync {
    async fn query_room_version_for_room(
        &self,
        room_id: &str,
    ) -> Result<String, RoomserverApiError>;

    /// State after `prev_event_ids`, restricted to `state_wanted` when
    /// given. `prev_events_exist` is only true when *all* ids are held.
    async fn query_state_after_events(
        &self,
        room_id: &str,
        prev_event_ids: &[String],
        state_wanted: Option<&[StateTuple]>,
    ) -> Result<StateAfterEventsResponse, RoomserverApiError>;

    /// Bodies for the given ids. Missing ids are simply absent.
    async fn query_events_by_id(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<HeaderedEvent>, RoomserverApiError>;

    async fn query_latest_events_and_state(
        &self,
        room_id: &str,
        state_wanted: &[StateTuple],
    ) -> Result<LatestEventsResponse, RoomserverApiError>;
}

#[derive(Serialize)]
struct StateAfterEventsRequest<'a> {
    room_id: &'a str,
    prev_event_ids: &'a [String],
    state_to_fetch: Option<&'a [StateTuple]>,
}

#[derive(Deserialize)]
struct RoomVersionResponse {
    room_version: String,
}

#[derive(Deserialize)]
struct EventsByIdResponse {
    #[serde(default)]
    events: Vec<HeaderedEvent>,
}

/// Adapter for a room-server reachable over its internal HTTP API.
pub struct HttpRoomserverApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRoomserverApi {
    pub fn new(http_client: reqwest::Client, base_url: String) -> Self {
        Self { http_client, base_url }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, RoomserverApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Room server query");
        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RoomserverApiError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RoomserverApiError::Internal(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RoomserverApiError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RoomserverApi for HttpRoomserverApi {
    async fn query_room_version_for_room(
        &self,
        room_id: &str,
    ) -> Result<String, RoomserverApiError> {
        let response: RoomVersionResponse = self
            .post(
                "/api/roomserver/queryRoomVersionForRoom",
                &serde_json::json!({ "room_id": room_id }),
            )
            .await?;
        if response.room_version.is_empty() {
            return Err(RoomserverApiError::NotFound(room_id.to_string()));
        }
        Ok(response.room_version)
    }

    async fn query_state_after_events(
        &self,
        room_id: &str,
        prev_event_ids: &[String],
        state_wanted: Option<&[StateTuple]>,
    ) -> Result<StateAfterEventsResponse, RoomserverApiError> {
        self.post(
            "/api/roomserver/queryStateAfterEvents",
            &StateAfterEventsRequest {
                room_id,
                prev_event_ids,
                state_to_fetch: state_wanted,
            },
        )
        .await
    }

    async fn query_events_by_id(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<HeaderedEvent>, RoomserverApiError> {
        let response: EventsByIdResponse = self
            .post(
                "/api/roomserver/queryEventsByID",
                &serde_json::json!({ "event_ids": event_ids }),
            )
            .await?;
        Ok(response.events)
    }

    async fn query_latest_events_and_state(
        &self,
        room_id: &str,
        state_wanted: &[StateTuple],
    ) -> Result<LatestEventsResponse, RoomserverApiError> {
        self.post(
            "/api/roomserver/queryLatestEventsAndState",
            &serde_json::json!({
                "room_id": room_id,
                "state_to_fetch": state_wanted,
            }),
        )
        .await
    }
}
