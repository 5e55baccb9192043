use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use fedrix_entity::types::{Transaction, TransactionResponse};

use crate::error::MatrixError;
use crate::federation::{TxnProcessor, TxnProcessorParams};
use crate::state::AppState;

/// PUT /_matrix/federation/v1/send/{txnId}
///
/// Push messages representing live activity to this server. The request
/// has already been authenticated by the X-Matrix middleware above this
/// handler; the envelope's `origin` is trusted at this point.
pub async fn put(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<TransactionResponse>, MatrixError> {
    let txn: Transaction = serde_json::from_value(payload).map_err(|err| {
        warn!(txn_id = %txn_id, error = %err, "Transaction body could not be decoded");
        MatrixError::NotJson(format!(
            "The request body could not be decoded into valid JSON. {err}"
        ))
    })?;
    if txn.origin.is_empty() {
        return Err(MatrixError::BadJson("transaction has no origin".to_string()));
    }

    debug!(
        txn_id = %txn_id,
        origin = %txn.origin,
        "Handling federation send request"
    );

    let processor = TxnProcessor::new(TxnProcessorParams {
        origin: txn.origin.clone(),
        transaction_id: Some(txn_id),
        roomserver: state.roomserver.clone(),
        federation: state.federation.clone(),
        producer: state.producer.clone(),
        edu_producer: state.edu_producer.clone(),
        key_ring: state.key_ring.clone(),
        request_token: state.shutdown.child_token(),
        shutdown_token: state.shutdown.clone(),
    });

    match processor.process_transaction(&txn).await {
        Ok(response) => Ok(Json(response)),
        Err(err) if err.is_bad_request() => Err(MatrixError::BadJson(err.to_string())),
        Err(err) => {
            // A 500 invites the sender to retry once we are feeling
            // better; anything else would permanently lose events.
            error!(error = %err, "Transaction processing failed");
            Err(MatrixError::Unknown)
        }
    }
}
