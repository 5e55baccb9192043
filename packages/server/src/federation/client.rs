//! Federation client for Matrix server-to-server queries
//!
//! The transaction processor only ever talks to remote servers through the
//! [`FederationApi`] trait, so tests can drive it with a fake. The
//! `reqwest`-backed implementation lives here too.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use fedrix_entity::types::{
    MissingEventsRequest, MissingEventsResponse, RemoteStateIds, StateSnapshot, Transaction,
};

use crate::federation::event_verifier::parse_untrusted;

#[derive(Debug, thiserror::Error)]
pub enum FederationApiError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("federation server error: {status_code} - {message}")]
    ServerError { status_code: u16, message: String },

    #[error("invalid server response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for FederationApiError {
    fn from(err: reqwest::Error) -> Self {
        FederationApiError::Http(err.to_string())
    }
}

/// The subset of federation capabilities transaction processing requires.
#[async_trait]
pub trait FederationApi: Send + Sync {
    /// `/state`: the full room state at `event_id`, bodies included.
    /// Events are parsed but not yet signature-verified; the caller
    /// validates the snapshot.
    async fn lookup_state(
        &self,
        server_name: &str,
        room_id: &str,
        event_id: &str,
        room_version: &str,
    ) -> Result<StateSnapshot, FederationApiError>;

    /// `/state_ids`: the room state at `event_id`, ids only.
    async fn lookup_state_ids(
        &self,
        server_name: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<RemoteStateIds, FederationApiError>;

    /// `/event`: a single event wrapped in a transaction envelope.
    async fn get_event(
        &self,
        server_name: &str,
        event_id: &str,
    ) -> Result<Transaction, FederationApiError>;

    /// `/get_missing_events`: events between our extremities and theirs.
    async fn lookup_missing_events(
        &self,
        server_name: &str,
        room_id: &str,
        request: &MissingEventsRequest,
        room_version: &str,
    ) -> Result<MissingEventsResponse, FederationApiError>;
}

/// Production federation client speaking the Matrix server-server API over
/// `reqwest`.
pub struct HttpFederationClient {
    http_client: reqwest::Client,
    use_https: bool,
    request_timeout: Duration,
}

impl HttpFederationClient {
    pub fn new(http_client: reqwest::Client, use_https: bool, timeout: Duration) -> Self {
        Self {
            http_client,
            use_https,
            request_timeout: timeout,
        }
    }

    fn base_url(&self, server_name: &str) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{server_name}")
    }

    async fn get_json(&self, url: &str) -> Result<Value, FederationApiError> {
        debug!(url = %url, "Federation GET");
        let response = self
            .http_client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Federation request failed");
            return Err(FederationApiError::ServerError {
                status_code: response.status().as_u16(),
                message: response.status().canonical_reason().unwrap_or("unknown").to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl FederationApi for HttpFederationClient {
    async fn lookup_state(
        &self,
        server_name: &str,
        room_id: &str,
        event_id: &str,
        room_version: &str,
    ) -> Result<StateSnapshot, FederationApiError> {
        let url = format!(
            "{}/_matrix/federation/v1/state/{}?event_id={}",
            self.base_url(server_name),
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
        );
        let body = self.get_json(&url).await?;

        let mut snapshot = StateSnapshot::default();
        for (field, out) in [
            ("auth_chain", &mut snapshot.auth_events),
            ("pdus", &mut snapshot.state_events),
        ] {
            let raw_events = body
                .get(field)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    FederationApiError::InvalidResponse(format!("/state missing {field:?}"))
                })?;
            for raw in raw_events {
                let event = parse_untrusted(raw, room_version).map_err(|e| {
                    FederationApiError::InvalidResponse(format!("bad event in /state: {e}"))
                })?;
                out.push(event);
            }
        }
        Ok(snapshot)
    }

    async fn lookup_state_ids(
        &self,
        server_name: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<RemoteStateIds, FederationApiError> {
        let url = format!(
            "{}/_matrix/federation/v1/state_ids/{}?event_id={}",
            self.base_url(server_name),
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
        );
        let body = self.get_json(&url).await?;

        let ids_of = |field: &str| -> Result<Vec<String>, FederationApiError> {
            body.get(field)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    FederationApiError::InvalidResponse(format!("/state_ids missing {field:?}"))
                })?
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        FederationApiError::InvalidResponse("non-string event id".to_string())
                    })
                })
                .collect()
        };
        Ok(RemoteStateIds {
            auth_event_ids: ids_of("auth_chain_ids")?,
            state_event_ids: ids_of("pdu_ids")?,
        })
    }

    async fn get_event(
        &self,
        server_name: &str,
        event_id: &str,
    ) -> Result<Transaction, FederationApiError> {
        let url = format!(
            "{}/_matrix/federation/v1/event/{}",
            self.base_url(server_name),
            urlencoding::encode(event_id),
        );
        let body = self.get_json(&url).await?;
        serde_json::from_value(body)
            .map_err(|e| FederationApiError::InvalidResponse(e.to_string()))
    }

    async fn lookup_missing_events(
        &self,
        server_name: &str,
        room_id: &str,
        request: &MissingEventsRequest,
        _room_version: &str,
    ) -> Result<MissingEventsResponse, FederationApiError> {
        let url = format!(
            "{}/_matrix/federation/v1/get_missing_events/{}",
            self.base_url(server_name),
            urlencoding::encode(room_id),
        );
        debug!(url = %url, limit = request.limit, min_depth = request.min_depth, "Federation POST");
        let response = self
            .http_client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&json!({
                "limit": request.limit,
                "min_depth": request.min_depth,
                "earliest_events": request.earliest_events,
                "latest_events": request.latest_events,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FederationApiError::ServerError {
                status_code: response.status().as_u16(),
                message: response.status().canonical_reason().unwrap_or("unknown").to_string(),
            });
        }
        Ok(response.json().await?)
    }
}
