use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Edu - Ephemeral Data Unit
///
/// Transient signals carried alongside PDUs in a transaction. Not part of
/// room history and never persisted by the ingress core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edu {
    pub edu_type: String,
    pub content: Value,
}

/// Content of an `m.typing` EDU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingContent {
    pub room_id: String,
    pub user_id: String,
    pub typing: bool,
}
