pub mod auth;
pub mod backfill;
pub mod client;
pub mod error;
pub mod event_verifier;
pub mod keyring;
pub mod producer;
pub mod resolver;
pub mod roomserver;
pub mod state_lookup;
pub mod transaction;

pub use error::TxnError;
pub use transaction::{TxnProcessor, TxnProcessorParams};
