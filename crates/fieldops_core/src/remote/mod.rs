//! Remote real-time document store seam.
//!
//! # Responsibility
//! - Define the live-query and write contract the engine depends on.
//! - Carry snapshots as live values so they pass through the sanitizer.
//!
//! # Invariants
//! - A `LiveQuery` stops delivering events once closed or dropped.
//! - Remote writes never block the caller's optimistic update; callers spawn
//!   them.

mod memory;

pub use memory::{MemoryRemoteStore, RemoteWriteLog, WriteKind};

use crate::config::CollectionQuery;
use crate::model::collection::Collection;
use crate::sanitize::LiveValue;
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::mpsc;

/// Network-level failure of a remote read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure or offline.
    Unavailable(String),
    /// The store refused the operation (permissions, invalid document).
    Rejected { code: String, message: String },
    /// The live query or client was already closed.
    Closed,
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(details) => write!(f, "remote store unavailable: {details}"),
            Self::Rejected { code, message } => write!(f, "remote store rejected ({code}): {message}"),
            Self::Closed => write!(f, "remote store connection closed"),
        }
    }
}

impl Error for RemoteError {}

/// Full current contents of one remote collection.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub collection: Collection,
    /// Expected to be an array of document objects; anything else is coerced
    /// to an empty list by the subscription manager.
    pub docs: LiveValue,
    /// Served from the local cache rather than confirmed by the server.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Snapshot(RemoteSnapshot),
    Error(RemoteError),
}

/// Open live query. Events arrive on `next`; `close` (or drop) unsubscribes.
pub struct LiveQuery {
    query: CollectionQuery,
    events: mpsc::UnboundedReceiver<SnapshotEvent>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl LiveQuery {
    pub fn new(
        query: CollectionQuery,
        events: mpsc::UnboundedReceiver<SnapshotEvent>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            query,
            events,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn query(&self) -> &CollectionQuery {
        &self.query
    }

    /// Waits for the next event; `None` once the remote side hung up.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.unsubscribe_once();
    }

    fn unsubscribe_once(&mut self) {
        self.events.close();
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unsubscribe_once();
    }
}

/// Remote real-time document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Opens a live query. The first event is the current snapshot.
    fn subscribe(&self, query: &CollectionQuery) -> Result<LiveQuery, RemoteError>;

    /// Creates or fully replaces one document.
    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        payload: Value,
    ) -> Result<(), RemoteError>;

    /// Merges `patch` into an existing document, creating it when missing.
    async fn merge_document(
        &self,
        collection: Collection,
        id: &str,
        patch: Value,
    ) -> Result<(), RemoteError>;

    async fn delete_document(&self, collection: Collection, id: &str) -> Result<(), RemoteError>;
}
