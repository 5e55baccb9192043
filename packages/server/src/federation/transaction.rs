//! Federation transaction processing
//!
//! Drives one inbound `send` transaction: parse and signature-verify every
//! PDU up front, then run each event through the per-event state machine,
//! collecting a per-event result map. EDUs ride along and can never fail
//! the transaction.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fedrix_entity::types::{
    Edu, HeaderedEvent, PduResult, Transaction, TransactionResponse, TypingContent,
};

use crate::federation::auth::{allowed, state_needed_for_auth, AuthState};
use crate::federation::client::FederationApi;
use crate::federation::error::TxnError;
use crate::federation::event_verifier::{parse_untrusted, EventVerifier};
use crate::federation::keyring::ServerKeyRing;
use crate::federation::producer::{EduProducer, OutputProducer, SendAsServer};
use crate::federation::roomserver::RoomserverApi;

/// Expiry attached to forwarded typing notifications.
pub(crate) const TYPING_EXPIRY_MS: i64 = 30_000;

/// Collaborators and identity for one transaction.
pub struct TxnProcessorParams {
    pub origin: String,
    pub transaction_id: Option<String>,
    pub roomserver: Arc<dyn RoomserverApi>,
    pub federation: Arc<dyn FederationApi>,
    pub producer: Arc<dyn OutputProducer>,
    pub edu_producer: Arc<dyn EduProducer>,
    pub key_ring: Arc<dyn ServerKeyRing>,
    /// Cancelled when the inbound request goes away.
    pub request_token: CancellationToken,
    /// Cancelled only on process shutdown. The gap-recovery handoff runs
    /// against this token alone, so a late client disconnect cannot throw
    /// away an expensively resolved state snapshot.
    pub shutdown_token: CancellationToken,
}

/// Result of the per-event state machine when re-entered during gap
/// recovery.
pub(crate) enum EventOutcome {
    Processed,
    /// A gap was found while already filling a gap. No further remote
    /// fetching happens; the event is reported upward so a single state
    /// snapshot can be taken at it.
    BackwardsExtremity(HeaderedEvent),
}

pub struct TxnProcessor {
    pub(crate) origin: String,
    pub(crate) transaction_id: Option<String>,
    pub(crate) roomserver: Arc<dyn RoomserverApi>,
    pub(crate) federation: Arc<dyn FederationApi>,
    pub(crate) producer: Arc<dyn OutputProducer>,
    pub(crate) edu_producer: Arc<dyn EduProducer>,
    pub(crate) verifier: EventVerifier,
    pub(crate) request_token: CancellationToken,
    pub(crate) shutdown_token: CancellationToken,
}

impl TxnProcessor {
    pub fn new(params: TxnProcessorParams) -> Self {
        Self {
            origin: params.origin,
            transaction_id: params.transaction_id,
            roomserver: params.roomserver,
            federation: params.federation,
            producer: params.producer,
            edu_producer: params.edu_producer,
            verifier: EventVerifier::new(params.key_ring),
            request_token: params.request_token,
            shutdown_token: params.shutdown_token,
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), TxnError> {
        if self.request_token.is_cancelled() {
            return Err(TxnError::Cancelled);
        }
        Ok(())
    }

    /// Process a whole transaction, producing the per-event result map.
    ///
    /// An error return means the transaction as a whole was rejected; the
    /// caller maps it onto a 400 or 500 via [`TxnError::is_bad_request`].
    pub async fn process_transaction(
        &self,
        txn: &Transaction,
    ) -> Result<TransactionResponse, TxnError> {
        info!(
            transaction_id = ?self.transaction_id,
            origin = %self.origin,
            pdus = txn.pdus.len(),
            edus = txn.edus.len(),
            "Received transaction"
        );

        // Parse and verify everything before touching room state: a
        // malformed or forged PDU rejects the whole transaction.
        let mut pdus: Vec<HeaderedEvent> = Vec::with_capacity(txn.pdus.len());
        for raw in &txn.pdus {
            self.ensure_active()?;

            let room_id = raw.get("room_id").and_then(Value::as_str).ok_or_else(|| {
                warn!("Transaction PDU carries no room_id");
                TxnError::Unmarshal {
                    cause: "event has no room_id".to_string(),
                }
            })?;

            let room_version = match self.roomserver.query_room_version_for_room(room_id).await {
                Ok(version) => version,
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "Failed to query room version");
                    return Err(TxnError::RoomNotFound(room_id.to_string()));
                }
            };

            let event = parse_untrusted(raw, &room_version).map_err(|err| {
                warn!(room_id = %room_id, error = %err, "Failed to parse transaction PDU");
                TxnError::from(err)
            })?;
            let headered = event.headered(&room_version);

            self.verifier
                .verify_signatures(std::slice::from_ref(&headered))
                .await
                .map_err(|err| {
                    warn!(event_id = %headered.event_id(), error = %err, "Signature verification failed");
                    TxnError::from(err)
                })?;
            pdus.push(headered);
        }

        let mut results: BTreeMap<String, PduResult> = BTreeMap::new();
        for event in &pdus {
            let event_id = event.event_id().to_string();
            match self.process_event(event.clone(), true).await {
                Ok(()) => {
                    results.insert(event_id, PduResult::ok());
                }
                Err(err) if err.is_skippable() => {
                    // The event itself is at fault; report it to the sender
                    // and carry on with the rest of the transaction.
                    warn!(event_id = %event_id, error = %err, "Skipping federation event");
                    results.insert(event_id, PduResult::failed(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        self.process_edus(&txn.edus).await;

        info!(
            transaction_id = ?self.transaction_id,
            pdus = results.len(),
            "Processed transaction"
        );
        Ok(TransactionResponse { pdus: results })
    }

    /// Run one event through the per-event state machine.
    ///
    /// `is_inbound_txn` is true for events delivered directly in a
    /// transaction and false when re-entered from gap recovery; the flag is
    /// an explicit parameter so either branch can be driven in isolation.
    pub async fn process_event(
        &self,
        event: HeaderedEvent,
        is_inbound_txn: bool,
    ) -> Result<(), TxnError> {
        match self.process_event_inner(event.clone(), is_inbound_txn).await? {
            EventOutcome::Processed => Ok(()),
            EventOutcome::BackwardsExtremity(extremity) => {
                self.resolve_and_send_with_state(&event, &extremity).await
            }
        }
    }

    pub(crate) fn process_event_inner<'a>(
        &'a self,
        event: HeaderedEvent,
        is_inbound_txn: bool,
    ) -> Pin<Box<dyn Future<Output = Result<EventOutcome, TxnError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_active()?;

            let prev_event_ids = event.event.prev_event_ids().to_vec();
            info!(
                event_id = %event.event_id(),
                prev_events = ?prev_event_ids,
                "Processing federation event"
            );

            let needed = state_needed_for_auth(&event.event);
            let state_resp = self
                .roomserver
                .query_state_after_events(event.room_id(), &prev_event_ids, Some(&needed))
                .await?;

            if !state_resp.room_exists {
                return Err(TxnError::RoomNotFound(event.room_id().to_string()));
            }

            if !state_resp.prev_events_exist {
                if is_inbound_txn {
                    self.process_event_with_missing_state(&event).await?;
                    return Ok(EventOutcome::Processed);
                }
                // Already filling a gap; stop here and let the caller take
                // a state snapshot instead of fetching ever further back.
                debug!(
                    event_id = %event.event_id(),
                    "Gap encountered during gap recovery, marking backwards extremity"
                );
                return Ok(EventOutcome::BackwardsExtremity(event));
            }

            let auth_state =
                AuthState::from_events(state_resp.state_events.iter().map(|h| &h.event))
                    .map_err(|e| TxnError::InvalidStateSnapshot(e.to_string()))?;
            allowed(&event.event, &auth_state)?;

            self.producer
                .send_events(
                    std::slice::from_ref(&event),
                    SendAsServer::DoNotSendToOtherServers,
                    None,
                )
                .await?;
            Ok(EventOutcome::Processed)
        })
    }

    /// EDUs are best-effort: failures are logged and never surface in the
    /// PDU results or the HTTP status.
    pub(crate) async fn process_edus(&self, edus: &[Edu]) {
        for edu in edus {
            match edu.edu_type.as_str() {
                "m.typing" => {
                    let typing: TypingContent = match serde_json::from_value(edu.content.clone())
                    {
                        Ok(typing) => typing,
                        Err(err) => {
                            warn!(error = %err, "Failed to parse typing EDU");
                            continue;
                        }
                    };
                    if let Err(err) = self
                        .edu_producer
                        .send_typing(
                            &typing.user_id,
                            &typing.room_id,
                            typing.typing,
                            TYPING_EXPIRY_MS,
                        )
                        .await
                    {
                        warn!(error = %err, "Failed to forward typing notification");
                    }
                }
                other => {
                    warn!(edu_type = %other, "unhandled edu");
                }
            }
        }
    }
}
