pub mod _matrix;
pub mod config;
pub mod error;
pub mod federation;
pub mod state;

use axum::routing::put;
use axum::Router;

use crate::state::AppState;

/// Build the federation router. Request authentication (X-Matrix header
/// verification) is applied by middleware above this router.
pub fn federation_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/_matrix/federation/v1/send/:txn_id",
            put(_matrix::federation::v1::send::by_txn_id::put),
        )
        .with_state(state)
}
