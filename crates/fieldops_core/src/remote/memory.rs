//! In-process `RemoteStore` with live-query broadcast.
//!
//! # Responsibility
//! - Emulate the remote store's observable behavior: initial snapshot on
//!   subscribe, a full snapshot to every matching subscriber after each write.
//! - Offer failure injection and raw emission for exercising sync paths.
//!
//! # Invariants
//! - Documents keep insertion order; queries may re-order a copy.
//! - Snapshot documents always carry their `id` field.

use super::{LiveQuery, RemoteError, RemoteSnapshot, RemoteStore, SnapshotEvent};
use crate::config::{CollectionQuery, SortDirection};
use crate::model::collection::Collection;
use crate::sanitize::LiveValue;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Kind of remote write observed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Merge,
    Delete,
}

/// One write accepted (or refused) by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWriteLog {
    pub kind: WriteKind,
    pub collection: Collection,
    pub id: String,
    pub payload: Option<Value>,
    pub accepted: bool,
}

struct Subscriber {
    id: u64,
    query: CollectionQuery,
    sender: mpsc::UnboundedSender<SnapshotEvent>,
}

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<Collection, Vec<(String, Map<String, Value>)>>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    fail_writes: bool,
    writes: Vec<RemoteWriteLog>,
}

#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following write fail with `RemoteError::Unavailable`.
    pub fn fail_writes(&self, enabled: bool) {
        self.lock().fail_writes = enabled;
    }

    /// Seeds documents without logging a write; subscribers are notified.
    pub fn seed(&self, collection: Collection, docs: impl IntoIterator<Item = Value>) {
        let mut state = self.lock();
        for doc in docs {
            if let Value::Object(map) = doc {
                if let Some(id) = map.get("id").and_then(Value::as_str).map(str::to_string) {
                    upsert(state.docs.entry(collection).or_default(), id, map);
                }
            }
        }
        broadcast(&mut state, collection);
    }

    /// Delivers an arbitrary payload to subscribers of `collection`.
    pub fn emit_raw(&self, collection: Collection, docs: LiveValue, from_cache: bool) {
        let mut state = self.lock();
        let event = SnapshotEvent::Snapshot(RemoteSnapshot {
            collection,
            docs,
            from_cache,
        });
        state
            .subscribers
            .retain(|subscriber| {
                subscriber.query.collection != collection || subscriber.sender.send(event.clone()).is_ok()
            });
    }

    /// Delivers an error event to subscribers of `collection`.
    pub fn emit_error(&self, collection: Collection, error: RemoteError) {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| {
            subscriber.query.collection != collection
                || subscriber.sender.send(SnapshotEvent::Error(error.clone())).is_ok()
        });
    }

    pub fn document(&self, collection: Collection, id: &str) -> Option<Value> {
        self.lock().docs.get(&collection).and_then(|docs| {
            docs.iter()
                .find(|(doc_id, _)| doc_id == id)
                .map(|(_, map)| Value::Object(map.clone()))
        })
    }

    pub fn document_count(&self, collection: Collection) -> usize {
        self.lock().docs.get(&collection).map_or(0, Vec::len)
    }

    pub fn writes(&self) -> Vec<RemoteWriteLog> {
        self.lock().writes.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        state.subscribers.len()
    }

    fn record_write(
        &self,
        kind: WriteKind,
        collection: Collection,
        id: &str,
        payload: Option<Value>,
        apply: impl FnOnce(&mut Vec<(String, Map<String, Value>)>),
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let accepted = !state.fail_writes;
        state.writes.push(RemoteWriteLog {
            kind,
            collection,
            id: id.to_string(),
            payload,
            accepted,
        });
        if !accepted {
            return Err(RemoteError::Unavailable("simulated network failure".to_string()));
        }
        apply(state.docs.entry(collection).or_default());
        broadcast(&mut state, collection);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn subscribe(&self, query: &CollectionQuery) -> Result<LiveQuery, RemoteError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        let initial = snapshot_for(&state, query);
        if sender.send(SnapshotEvent::Snapshot(initial)).is_err() {
            return Err(RemoteError::Closed);
        }
        state.subscribers.push(Subscriber {
            id,
            query: query.clone(),
            sender,
        });

        let shared = Arc::clone(&self.state);
        Ok(LiveQuery::new(query.clone(), receiver, move || {
            let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.subscribers.retain(|subscriber| subscriber.id != id);
        }))
    }

    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        payload: Value,
    ) -> Result<(), RemoteError> {
        let mut map = match payload.clone() {
            Value::Object(map) => map,
            _ => {
                return Err(RemoteError::Rejected {
                    code: "invalid-argument".to_string(),
                    message: "document payload must be an object".to_string(),
                })
            }
        };
        map.insert("id".to_string(), Value::String(id.to_string()));
        self.record_write(WriteKind::Set, collection, id, Some(payload), |docs| {
            upsert(docs, id.to_string(), map)
        })
    }

    async fn merge_document(
        &self,
        collection: Collection,
        id: &str,
        patch: Value,
    ) -> Result<(), RemoteError> {
        let Value::Object(patch_map) = patch.clone() else {
            return Err(RemoteError::Rejected {
                code: "invalid-argument".to_string(),
                message: "merge patch must be an object".to_string(),
            });
        };
        self.record_write(WriteKind::Merge, collection, id, Some(patch), |docs| {
            match docs.iter_mut().find(|(doc_id, _)| doc_id == id) {
                Some((_, existing)) => {
                    for (key, value) in patch_map {
                        existing.insert(key, value);
                    }
                }
                None => {
                    let mut created = patch_map;
                    created.insert("id".to_string(), Value::String(id.to_string()));
                    docs.push((id.to_string(), created));
                }
            }
        })
    }

    async fn delete_document(&self, collection: Collection, id: &str) -> Result<(), RemoteError> {
        self.record_write(WriteKind::Delete, collection, id, None, |docs| {
            docs.retain(|(doc_id, _)| doc_id != id)
        })
    }
}

fn upsert(docs: &mut Vec<(String, Map<String, Value>)>, id: String, map: Map<String, Value>) {
    match docs.iter_mut().find(|(doc_id, _)| *doc_id == id) {
        Some(entry) => entry.1 = map,
        None => docs.push((id, map)),
    }
}

fn broadcast(state: &mut MemoryState, collection: Collection) {
    let snapshots: Vec<(u64, RemoteSnapshot)> = state
        .subscribers
        .iter()
        .filter(|subscriber| subscriber.query.collection == collection)
        .map(|subscriber| (subscriber.id, snapshot_for(state, &subscriber.query)))
        .collect();
    for (id, snapshot) in snapshots {
        let delivered = state
            .subscribers
            .iter()
            .find(|subscriber| subscriber.id == id)
            .map(|subscriber| subscriber.sender.send(SnapshotEvent::Snapshot(snapshot)).is_ok())
            .unwrap_or(false);
        if !delivered {
            state.subscribers.retain(|subscriber| subscriber.id != id);
        }
    }
}

fn snapshot_for(state: &MemoryState, query: &CollectionQuery) -> RemoteSnapshot {
    let mut docs: Vec<Map<String, Value>> = state
        .docs
        .get(&query.collection)
        .map(|docs| docs.iter().map(|(_, map)| map.clone()).collect())
        .unwrap_or_default();

    if let Some((field, expected)) = &query.filter {
        docs.retain(|doc| doc.get(field) == Some(expected));
    }
    if let Some((field, direction)) = &query.order_by {
        docs.sort_by(|left, right| {
            let ordering = compare_values(left.get(field), right.get(field));
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
    }
    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }

    let docs = Value::Array(docs.into_iter().map(Value::Object).collect());
    RemoteSnapshot {
        collection: query.collection,
        docs: LiveValue::from(docs),
        from_cache: false,
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryRemoteStore, WriteKind};
    use crate::config::{CollectionQuery, SortDirection};
    use crate::model::collection::Collection;
    use crate::remote::{RemoteStore, SnapshotEvent};
    use crate::sanitize::Sanitizer;
    use serde_json::json;

    async fn next_docs(query: &mut crate::remote::LiveQuery) -> serde_json::Value {
        match query.next().await {
            Some(SnapshotEvent::Snapshot(snapshot)) => {
                Sanitizer::default().sanitize(&snapshot.docs).unwrap()
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_emits_initial_snapshot_then_updates() {
        let store = MemoryRemoteStore::new();
        store.seed(Collection::Clients, [json!({"id": "c1", "name": "Ana"})]);
        let mut query = store
            .subscribe(&CollectionQuery::all(Collection::Clients))
            .unwrap();
        assert_eq!(next_docs(&mut query).await, json!([{"id": "c1", "name": "Ana"}]));

        store
            .set_document(Collection::Clients, "c2", json!({"name": "Bo"}))
            .await
            .unwrap();
        let docs = next_docs(&mut query).await;
        assert_eq!(docs.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn queries_filter_order_and_limit() {
        let store = MemoryRemoteStore::new();
        store.seed(
            Collection::Notifications,
            [
                json!({"id": "n1", "to": "u1", "createdAt": 1}),
                json!({"id": "n2", "to": "u1", "createdAt": 3}),
                json!({"id": "n3", "to": "u2", "createdAt": 2}),
                json!({"id": "n4", "to": "u1", "createdAt": 2}),
            ],
        );
        let query = CollectionQuery::all(Collection::Notifications)
            .with_filter("to", json!("u1"))
            .with_order("createdAt", SortDirection::Desc)
            .with_limit(2);
        let mut live = store.subscribe(&query).unwrap();
        let docs = next_docs(&mut live).await;
        let ids: Vec<&str> = docs
            .as_array()
            .unwrap()
            .iter()
            .map(|doc| doc["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["n2", "n4"]);
    }

    #[tokio::test]
    async fn failed_writes_are_logged_and_not_applied() {
        let store = MemoryRemoteStore::new();
        store.fail_writes(true);
        let err = store
            .set_document(Collection::Projects, "p1", json!({"name": "x"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
        assert_eq!(store.document_count(Collection::Projects), 0);
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, WriteKind::Set);
        assert!(!writes[0].accepted);
    }

    #[tokio::test]
    async fn closing_a_live_query_unsubscribes() {
        let store = MemoryRemoteStore::new();
        let query = store
            .subscribe(&CollectionQuery::all(Collection::Users))
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);
        query.close();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn merge_creates_missing_documents() {
        let store = MemoryRemoteStore::new();
        store
            .merge_document(Collection::Projects, "p1", json!({"status": "active"}))
            .await
            .unwrap();
        assert_eq!(
            store.document(Collection::Projects, "p1"),
            Some(json!({"status": "active", "id": "p1"}))
        );
    }
}
