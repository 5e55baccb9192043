use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use fedrix_server::config::ServerConfig;
use fedrix_server::federation::client::HttpFederationClient;
use fedrix_server::federation::keyring::RemoteKeyRing;
use fedrix_server::federation::producer::BusProducer;
use fedrix_server::federation::roomserver::HttpRoomserverApi;
use fedrix_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::get();
    let timeout = Duration::from_secs(config.federation_timeout_secs);
    let http_client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("fedrix-server/0.1")
        .build()?;

    let shutdown = CancellationToken::new();
    let (producer, mut bus_receiver) = BusProducer::new();
    let producer = Arc::new(producer);

    // Drain the downstream bus. In a full deployment the sync api and
    // application services consume these messages; the standalone binary
    // just traces them.
    tokio::spawn(async move {
        while let Some(message) = bus_receiver.recv().await {
            debug!(
                room_id = %message.room_id,
                bytes = message.payload.len(),
                "Output event produced"
            );
        }
    });

    let state = AppState {
        config,
        roomserver: Arc::new(HttpRoomserverApi::new(
            http_client.clone(),
            config.roomserver_url.clone(),
        )),
        federation: Arc::new(HttpFederationClient::new(
            http_client.clone(),
            config.use_https,
            timeout,
        )),
        producer: producer.clone(),
        edu_producer: producer,
        key_ring: Arc::new(RemoteKeyRing::new(http_client, config.use_https)),
        shutdown: shutdown.clone(),
    };

    let app = fedrix_server::federation_routes(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Federation ingress listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
            server_shutdown.cancel();
        })
        .await?;
    Ok(())
}
