//! Collection-scoped record held in memory.
//!
//! # Responsibility
//! - Carry one sanitized entity payload with its identity and provenance.
//!
//! # Invariants
//! - `payload` is plain data produced by the sanitizer.
//! - `payload["id"]` mirrors `id` whenever the record was built through
//!   [`Record::from_payload`].

use crate::model::collection::Collection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Plain JSON object payload.
pub type Payload = Map<String, Value>;

/// Where the current value of a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Optimistic local mutation or local snapshot hydration.
    Local,
    /// Delivered by a live query snapshot.
    Remote,
}

/// One business entity instance within a named collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Physical source collection (partners stay `Partners` inside the clients slot).
    pub collection: Collection,
    pub payload: Payload,
    pub origin: Origin,
    pub merged_at: DateTime<Utc>,
}

impl Record {
    /// Builds a record from a sanitized payload, reading the id from `payload["id"]`.
    ///
    /// Returns `None` when the payload carries no usable id. Numeric ids are
    /// accepted and normalized to text.
    pub fn from_payload(
        collection: Collection,
        mut payload: Payload,
        origin: Origin,
        merged_at: DateTime<Utc>,
    ) -> Option<Self> {
        let id = match payload.get("id") {
            Some(Value::String(value)) if !value.trim().is_empty() => value.trim().to_string(),
            Some(Value::Number(value)) => value.to_string(),
            _ => return None,
        };
        payload.insert("id".to_string(), Value::String(id.clone()));
        Some(Self {
            id,
            collection,
            payload,
            origin,
            merged_at,
        })
    }

    /// Reads one string field from the payload.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Returns the payload as an owned JSON object value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}
