use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;
use tracing::{info, warn};

static SERVER_CONFIG: OnceLock<ServerConfig> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name this homeserver is known by on the federation
    pub homeserver_name: String,

    /// Address the federation listener binds to
    pub bind_address: String,

    /// Base URL of the internal room-server API
    pub roomserver_url: String,

    /// Timeout applied to outbound federation requests, in seconds
    pub federation_timeout_secs: u64,

    /// Whether outbound federation requests use https
    pub use_https: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            homeserver_name: "localhost".to_string(),
            bind_address: "0.0.0.0:8448".to_string(),
            roomserver_url: "http://127.0.0.1:7770".to_string(),
            federation_timeout_secs: 30,
            use_https: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let homeserver_name = env::var("FEDRIX_SERVER_NAME").unwrap_or_else(|_| {
            warn!("FEDRIX_SERVER_NAME not set, using {}", defaults.homeserver_name);
            defaults.homeserver_name.clone()
        });

        let config = Self {
            homeserver_name,
            bind_address: env::var("FEDRIX_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            roomserver_url: env::var("FEDRIX_ROOMSERVER_URL").unwrap_or(defaults.roomserver_url),
            federation_timeout_secs: env::var("FEDRIX_FEDERATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.federation_timeout_secs),
            use_https: env::var("FEDRIX_USE_HTTPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.use_https),
        };

        info!(
            server_name = %config.homeserver_name,
            bind_address = %config.bind_address,
            "Loaded server configuration"
        );
        config
    }

    /// The process-wide configuration, loaded once on first use.
    pub fn get() -> &'static ServerConfig {
        SERVER_CONFIG.get_or_init(ServerConfig::from_env)
    }
}
