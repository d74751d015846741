//! Live object graph handed over by UI and remote callbacks.
//!
//! # Responsibility
//! - Represent values that plain JSON cannot: shared and cyclic nodes,
//!   temporal values, document references, functions and framework handles.
//! - Give every container node a stable identity for cycle detection.
//!
//! # Invariants
//! - Container identity is pointer identity of the shared node; clones of a
//!   `LiveObject`/`LiveArray` handle refer to the same node.
//! - A poisoned node lock reads as empty, never panics.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Number, Value};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};

/// Remote temporal value that converts itself to a UTC instant.
///
/// The conversion may fail (out-of-range or corrupt values); callers treat
/// failure as a null timestamp.
pub trait PlainDate: Send + Sync {
    fn to_plain_date(&self) -> Result<DateTime<Utc>, String>;
}

/// Seconds/nanoseconds timestamp as delivered by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl PlainDate for RemoteTimestamp {
    fn to_plain_date(&self) -> Result<DateTime<Utc>, String> {
        Utc.timestamp_opt(self.seconds, self.nanos)
            .single()
            .ok_or_else(|| format!("timestamp out of range: {}s {}ns", self.seconds, self.nanos))
    }
}

/// Opaque handle to the remote store owning a document reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle(pub Arc<str>);

/// Reference to a remote document (`{storeHandle, path}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub store: StoreHandle,
    pub path: String,
}

/// UI-framework owned values that must never be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameworkHandle {
    /// Rendered element or component instance.
    Element(String),
    /// Input/synthetic event.
    Event(String),
    /// Global singleton (window, document, navigator...).
    Global(String),
}

/// Shared, mutable array node.
#[derive(Clone, Default)]
pub struct LiveArray(Arc<RwLock<Vec<LiveValue>>>);

impl LiveArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = LiveValue>) -> Self {
        Self(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    pub fn push(&self, value: impl Into<LiveValue>) {
        if let Ok(mut items) = self.0.write() {
            items.push(value.into());
        }
    }

    /// Snapshot of the current items. Handles inside are shared, not deep-copied.
    pub fn items(&self) -> Vec<LiveValue> {
        self.0.read().map(|items| items.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Shared, mutable object node with insertion-ordered keys.
#[derive(Clone, Default)]
pub struct LiveObject(Arc<RwLock<Vec<(String, LiveValue)>>>);

impl LiveObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, LiveValue)>) -> Self {
        let object = Self::new();
        for (key, value) in pairs {
            object.insert(key, value);
        }
        object
    }

    /// Inserts or replaces `key`, keeping the original position on replace.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<LiveValue>) {
        let key = key.into();
        let value = value.into();
        if let Ok(mut entries) = self.0.write() {
            match entries.iter_mut().find(|(existing, _)| *existing == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<LiveValue> {
        self.0.read().ok().and_then(|entries| {
            entries
                .iter()
                .find(|(existing, _)| existing == key)
                .map(|(_, value)| value.clone())
        })
    }

    pub fn entries(&self) -> Vec<(String, LiveValue)> {
        self.0.read().map(|entries| entries.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Discriminated live value. Every special case the serializer knows about
/// is a variant here, so the sanitizer decides with one exhaustive match.
#[derive(Clone)]
pub enum LiveValue {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    Timestamp(DateTime<Utc>),
    DateLike(Arc<dyn PlainDate>),
    DocumentRef(DocumentRef),
    Function(Arc<str>),
    Framework(FrameworkHandle),
    Array(LiveArray),
    Object(LiveObject),
}

impl LiveValue {
    /// Builds a number; non-finite floats become `Null`.
    pub fn float(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }

    pub fn function(name: &str) -> Self {
        Self::Function(Arc::from(name))
    }

    pub fn date_like(value: impl PlainDate + 'static) -> Self {
        Self::DateLike(Arc::new(value))
    }

    pub fn as_object(&self) -> Option<&LiveObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&LiveArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }
}

// Shallow on purpose: live graphs may be cyclic.
impl Debug for LiveValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(value) => write!(f, "Bool({value})"),
            Self::Number(value) => write!(f, "Number({value})"),
            Self::Text(value) => write!(f, "Text({value:?})"),
            Self::Timestamp(value) => write!(f, "Timestamp({value})"),
            Self::DateLike(_) => f.write_str("DateLike(..)"),
            Self::DocumentRef(reference) => write!(f, "DocumentRef({})", reference.path),
            Self::Function(name) => write!(f, "Function({name})"),
            Self::Framework(handle) => write!(f, "Framework({handle:?})"),
            Self::Array(array) => write!(f, "Array(#{:x}, len={})", array.node_id(), array.len()),
            Self::Object(object) => {
                write!(f, "Object(#{:x}, len={})", object.node_id(), object.len())
            }
        }
    }
}

impl From<Value> for LiveValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(value) => Self::Number(value),
            Value::String(value) => Self::Text(value),
            Value::Array(items) => {
                Self::Array(LiveArray::from_items(items.into_iter().map(Self::from)))
            }
            Value::Object(entries) => Self::Object(LiveObject::from_pairs(
                entries.into_iter().map(|(key, value)| (key, Self::from(value))),
            )),
        }
    }
}

impl From<&Value> for LiveValue {
    fn from(value: &Value) -> Self {
        Self::from(value.clone())
    }
}

impl From<&str> for LiveValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for LiveValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for LiveValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for LiveValue {
    fn from(value: i64) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<f64> for LiveValue {
    fn from(value: f64) -> Self {
        Self::float(value)
    }
}

impl From<DateTime<Utc>> for LiveValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<DocumentRef> for LiveValue {
    fn from(value: DocumentRef) -> Self {
        Self::DocumentRef(value)
    }
}

impl From<FrameworkHandle> for LiveValue {
    fn from(value: FrameworkHandle) -> Self {
        Self::Framework(value)
    }
}

impl From<LiveObject> for LiveValue {
    fn from(value: LiveObject) -> Self {
        Self::Object(value)
    }
}

impl From<LiveArray> for LiveValue {
    fn from(value: LiveArray) -> Self {
        Self::Array(value)
    }
}
