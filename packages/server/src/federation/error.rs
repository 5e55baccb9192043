//! Error taxonomy for transaction processing
//!
//! Every failure during transaction processing falls into one of three
//! dispositions: it makes the request itself malformed (400 to the sender),
//! it is the fault of a single event (skipped, reported in the result map),
//! or it is a temporary local failure (500, inviting a retry).

use crate::federation::auth::NotAllowedError;
use crate::federation::client::FederationApiError;
use crate::federation::event_verifier::VerifierError;
use crate::federation::producer::ProducerError;
use crate::federation::resolver::ResolveError;
use crate::federation::roomserver::RoomserverApiError;

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("room {0:?} not found")]
    RoomNotFound(String),

    #[error("unable to parse event: {cause}")]
    Unmarshal { cause: String },

    #[error("unable to verify signature of event {event_id:?}: {cause}")]
    VerifySig { event_id: String, cause: String },

    #[error(transparent)]
    NotAllowed(#[from] NotAllowedError),

    #[error("unable to get prev_events for event {event_id:?}: {cause}")]
    MissingPrevEvents { event_id: String, cause: String },

    #[error("room server query failed: {0}")]
    Roomserver(#[from] RoomserverApiError),

    #[error("federation request failed: {0}")]
    Federation(#[from] FederationApiError),

    #[error("output producer failed: {0}")]
    Producer(#[from] ProducerError),

    #[error("state resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("state snapshot invalid: {0}")]
    InvalidStateSnapshot(String),

    #[error("request cancelled")]
    Cancelled,
}

impl TxnError {
    /// Errors caused by one bad event. The event is skipped and its error
    /// string is reported in the result map; the rest of the transaction
    /// proceeds.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            TxnError::RoomNotFound(_)
                | TxnError::NotAllowed(_)
                | TxnError::MissingPrevEvents { .. }
        )
    }

    /// Errors that mean the sender's request was malformed. The whole
    /// transaction is rejected with a 400; a retry of the same bytes would
    /// fail the same way.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            TxnError::RoomNotFound(_)
                | TxnError::Unmarshal { .. }
                | TxnError::VerifySig { .. }
        )
    }
}

impl From<VerifierError> for TxnError {
    fn from(err: VerifierError) -> Self {
        match err {
            VerifierError::Unmarshal(cause) => TxnError::Unmarshal { cause },
            VerifierError::Signature { event_id, cause } => {
                TxnError::VerifySig { event_id, cause }
            }
        }
    }
}
