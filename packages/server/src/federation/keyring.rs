//! Server signing key lookup
//!
//! Event signature verification needs the Ed25519 public keys of remote
//! servers. Fetching and caching those keys is this module's job; the
//! verifier only ever asks for a pinned key by `(server_name, key_id)`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use tracing::{debug, warn};

use fedrix_entity::utils::canonical_json;

#[derive(Debug, thiserror::Error)]
pub enum KeyRingError {
    #[error("no verify key known for {server_name}:{key_id}")]
    UnknownKey { server_name: String, key_id: String },

    #[error("failed to fetch server keys from {server_name}: {cause}")]
    Fetch { server_name: String, cause: String },

    #[error("invalid verify key for {server_name}: {cause}")]
    InvalidKey { server_name: String, cause: String },
}

/// Read-only source of server signing keys.
#[async_trait]
pub trait ServerKeyRing: Send + Sync {
    async fn verify_key(
        &self,
        server_name: &str,
        key_id: &str,
    ) -> Result<VerifyingKey, KeyRingError>;
}

/// A fixed set of pinned keys. The test seam, and useful for closed
/// federations where keys are distributed out of band.
#[derive(Default)]
pub struct StaticKeyRing {
    keys: HashMap<(String, String), VerifyingKey>,
}

impl StaticKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server_name: &str, key_id: &str, key: VerifyingKey) {
        self.keys.insert((server_name.to_string(), key_id.to_string()), key);
    }
}

#[async_trait]
impl ServerKeyRing for StaticKeyRing {
    async fn verify_key(
        &self,
        server_name: &str,
        key_id: &str,
    ) -> Result<VerifyingKey, KeyRingError> {
        self.keys
            .get(&(server_name.to_string(), key_id.to_string()))
            .copied()
            .ok_or_else(|| KeyRingError::UnknownKey {
                server_name: server_name.to_string(),
                key_id: key_id.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct ServerKeysResponse {
    server_name: String,
    #[serde(default)]
    valid_until_ts: i64,
    #[serde(default)]
    verify_keys: HashMap<String, VerifyKeyObject>,
    #[serde(default)]
    signatures: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct VerifyKeyObject {
    key: String,
}

/// Key ring that fetches keys from the remote server's
/// `/_matrix/key/v2/server` endpoint and caches them until their
/// advertised expiry.
pub struct RemoteKeyRing {
    http_client: reqwest::Client,
    use_https: bool,
    cache: RwLock<HashMap<(String, String), CachedKey>>,
}

#[derive(Clone, Copy)]
struct CachedKey {
    key: VerifyingKey,
    valid_until_ts: i64,
}

impl RemoteKeyRing {
    pub fn new(http_client: reqwest::Client, use_https: bool) -> Self {
        Self {
            http_client,
            use_https,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, server_name: &str, key_id: &str) -> Option<VerifyingKey> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(&(server_name.to_string(), key_id.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();
        if entry.valid_until_ts > 0 && now > entry.valid_until_ts {
            return None;
        }
        Some(entry.key)
    }

    async fn fetch(&self, server_name: &str, key_id: &str) -> Result<VerifyingKey, KeyRingError> {
        let scheme = if self.use_https { "https" } else { "http" };
        let url = format!("{scheme}://{server_name}/_matrix/key/v2/server");
        debug!(server_name = %server_name, "Fetching server signing keys");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: format!("status {}", response.status()),
            });
        }

        let raw: serde_json::Value =
            response.json().await.map_err(|e| KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: e.to_string(),
            })?;
        let keys: ServerKeysResponse =
            serde_json::from_value(raw.clone()).map_err(|e| KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: e.to_string(),
            })?;

        if keys.server_name != server_name {
            return Err(KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: format!("key response is for {:?}", keys.server_name),
            });
        }
        let now = chrono::Utc::now().timestamp_millis();
        if keys.valid_until_ts > 0 && now > keys.valid_until_ts {
            return Err(KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: "key response has expired".to_string(),
            });
        }

        let requested = keys.verify_keys.get(key_id).ok_or_else(|| {
            KeyRingError::UnknownKey {
                server_name: server_name.to_string(),
                key_id: key_id.to_string(),
            }
        })?;
        let verify_key = decode_verify_key(server_name, &requested.key)?;

        self.check_self_signature(&raw, &keys, server_name)?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                (server_name.to_string(), key_id.to_string()),
                CachedKey {
                    key: verify_key,
                    valid_until_ts: keys.valid_until_ts,
                },
            );
        }
        Ok(verify_key)
    }

    /// The key response must be signed by at least one of the keys it
    /// advertises, otherwise a man in the middle could substitute keys.
    fn check_self_signature(
        &self,
        raw: &serde_json::Value,
        keys: &ServerKeysResponse,
        server_name: &str,
    ) -> Result<(), KeyRingError> {
        let server_sigs =
            keys.signatures.get(server_name).ok_or_else(|| KeyRingError::Fetch {
                server_name: server_name.to_string(),
                cause: "key response is unsigned".to_string(),
            })?;

        let mut unsigned = raw.clone();
        if let Some(obj) = unsigned.as_object_mut() {
            obj.remove("signatures");
        }
        let payload = canonical_json(&unsigned).map_err(|e| KeyRingError::Fetch {
            server_name: server_name.to_string(),
            cause: e.to_string(),
        })?;

        for (sig_key_id, sig_b64) in server_sigs {
            let Some(key_obj) = keys.verify_keys.get(sig_key_id) else {
                continue;
            };
            let Ok(verify_key) = decode_verify_key(server_name, &key_obj.key) else {
                continue;
            };
            let Ok(sig_bytes) = STANDARD_NO_PAD.decode(sig_b64.trim_end_matches('=')) else {
                continue;
            };
            let Ok(signature) = Signature::from_slice(&sig_bytes) else {
                continue;
            };
            if verify_key.verify_strict(payload.as_bytes(), &signature).is_ok() {
                return Ok(());
            }
            warn!(
                server_name = %server_name,
                key_id = %sig_key_id,
                "Server key self-signature did not verify"
            );
        }
        Err(KeyRingError::Fetch {
            server_name: server_name.to_string(),
            cause: "no valid self-signature on key response".to_string(),
        })
    }
}

#[async_trait]
impl ServerKeyRing for RemoteKeyRing {
    async fn verify_key(
        &self,
        server_name: &str,
        key_id: &str,
    ) -> Result<VerifyingKey, KeyRingError> {
        if let Some(key) = self.cached(server_name, key_id) {
            return Ok(key);
        }
        self.fetch(server_name, key_id).await
    }
}

fn decode_verify_key(server_name: &str, key_b64: &str) -> Result<VerifyingKey, KeyRingError> {
    let bytes = STANDARD_NO_PAD
        .decode(key_b64.trim_end_matches('='))
        .map_err(|e| KeyRingError::InvalidKey {
            server_name: server_name.to_string(),
            cause: e.to_string(),
        })?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyRingError::InvalidKey {
        server_name: server_name.to_string(),
        cause: "ed25519 key must be 32 bytes".to_string(),
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| KeyRingError::InvalidKey {
        server_name: server_name.to_string(),
        cause: e.to_string(),
    })
}
