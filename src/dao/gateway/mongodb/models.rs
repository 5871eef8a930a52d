use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity wrapped with string keys that filters and indexes address.
///
/// The entity itself is stored verbatim under `body`; lookups never depend on how the
/// driver encodes the ids inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stored<T> {
    #[serde(rename = "_id")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<String>,
    pub body: T,
}

impl<T> Stored<T> {
    pub fn new(id: Uuid, session_id: Option<Uuid>, body: T) -> Self {
        Self {
            key: id.to_string(),
            session: session_id.map(|id| id.to_string()),
            lookup: None,
            body,
        }
    }

    pub fn with_lookup(mut self, lookup: impl Into<String>) -> Self {
        self.lookup = Some(lookup.into());
        self
    }
}

/// Per-session broadcast counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDocument {
    #[serde(rename = "_id")]
    pub key: String,
    pub seq: i64,
}

/// Reserved join code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCodeDocument {
    #[serde(rename = "_id")]
    pub code: String,
    pub session: String,
}

/// Running projection of a ledger, updated in the same transaction as every append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerHeadDocument {
    #[serde(rename = "_id")]
    pub key: String,
    pub balance: i64,
    pub count: i64,
}

pub fn currency_scope(user_id: Uuid, tenant_id: Uuid) -> String {
    format!("{user_id}:{tenant_id}")
}

pub fn keyed(owner: Uuid, idempotency_key: &str) -> String {
    format!("{owner}:{idempotency_key}")
}
