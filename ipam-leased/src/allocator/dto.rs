//! Netbox REST payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::protocol::{CF_PLACEHOLDER, CF_RECORD_ID};

/// Paginated list envelope.
#[derive(Debug, Deserialize)]
pub struct NetboxList<T> {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetboxPrefix {
    pub id: i64,
    pub prefix: String,
    #[serde(default)]
    pub vrf: Option<NetboxRef>,
    #[serde(default)]
    pub tenant: Option<NetboxRef>,
}

/// Nested object reference; only the id matters to us.
#[derive(Debug, Clone, Deserialize)]
pub struct NetboxRef {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct NetboxChoiceSet {
    pub name: String,
    /// `[value, label]` pairs
    #[serde(default)]
    pub extra_choices: Vec<Vec<String>>,
}

/// Body for `POST prefixes/{id}/available-prefixes/` and `POST prefixes/`.
#[derive(Debug, Serialize)]
pub struct ReservePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vrf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<i64>,
    pub custom_fields: Map<String, Value>,
}

/// Body for `PATCH prefixes/{id}/`.
#[derive(Debug, Serialize)]
pub struct StampPayload {
    pub prefix: String,
    pub custom_fields: Map<String, Value>,
}

/// Custom fields written on every reservation. Netbox rejects objects with
/// required fields unset, so the unused ones get a placeholder.
pub fn custom_fields(record_id: Option<i64>) -> Map<String, Value> {
    let mut fields = Map::new();
    for name in ["domain", "env", "infra", "purpose"] {
        fields.insert(name.to_string(), Value::from(CF_PLACEHOLDER));
    }
    if let Some(id) = record_id {
        fields.insert(CF_RECORD_ID.to_string(), Value::from(id.to_string()));
    }
    fields
}
