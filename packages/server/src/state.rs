use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::federation::client::FederationApi;
use crate::federation::keyring::ServerKeyRing;
use crate::federation::producer::{EduProducer, OutputProducer};
use crate::federation::roomserver::RoomserverApi;

#[derive(Clone)]
pub struct AppState {
    pub config: &'static ServerConfig,
    pub roomserver: Arc<dyn RoomserverApi>,
    pub federation: Arc<dyn FederationApi>,
    pub producer: Arc<dyn OutputProducer>,
    pub edu_producer: Arc<dyn EduProducer>,
    pub key_ring: Arc<dyn ServerKeyRing>,
    /// Cancelled when the process is shutting down.
    pub shutdown: CancellationToken,
}
