//! Optimistic mutation coordinator.
//!
//! # Responsibility
//! - Validate, sanitize and apply create/update/delete to the store before
//!   any remote call, so the change is visible immediately.
//! - Issue the matching remote write in the background and log its outcome.
//! - Link new projects to an existing client by name or email, synthesizing
//!   the client when none matches.
//!
//! # Invariants
//! - Only `ValidationError` is returned; it is raised before any state
//!   changes.
//! - Remote and webhook failures never undo local state and never reach the
//!   caller except through an explicitly awaited `RemoteWrite`.

use crate::clock::Clock;
use crate::config::WebhookEvent;
use crate::model::collection::{Collection, StateSlot};
use crate::model::entity::{Client, Entity, Project};
use crate::model::record::{Origin, Record};
use crate::model::validation::ValidationError;
use crate::remote::{RemoteError, RemoteStore};
use crate::sanitize::Sanitizer;
use crate::sync::store::{StoreEvent, SyncStore};
use crate::webhook::WebhookSink;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Create,
    Update,
    Delete,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

fn webhook_event(collection: Collection, verb: Verb) -> Option<WebhookEvent> {
    match (collection, verb) {
        (Collection::Projects, Verb::Create) => Some(WebhookEvent::ProjectCreated),
        (Collection::Projects, Verb::Update) => Some(WebhookEvent::ProjectUpdated),
        (Collection::Projects, Verb::Delete) => Some(WebhookEvent::ProjectDeleted),
        (Collection::Clients, Verb::Create) => Some(WebhookEvent::ClientCreated),
        (Collection::Expenses, Verb::Create) => Some(WebhookEvent::ExpenseCreated),
        (Collection::Prospects, Verb::Create) => Some(WebhookEvent::ProspectCreated),
        _ => None,
    }
}

/// Handle to a background remote write.
///
/// Dropping it detaches the write; it still runs and logs its outcome.
#[derive(Debug)]
pub struct RemoteWrite {
    state: RemoteWriteState,
}

#[derive(Debug)]
enum RemoteWriteState {
    Spawned(JoinHandle<Result<(), RemoteError>>),
    Ready(Result<(), RemoteError>),
}

impl RemoteWrite {
    fn ready(result: Result<(), RemoteError>) -> Self {
        Self {
            state: RemoteWriteState::Ready(result),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            RemoteWriteState::Spawned(handle) => handle.is_finished(),
            RemoteWriteState::Ready(_) => true,
        }
    }

    /// Waits for the remote write and returns its outcome.
    pub async fn settled(self) -> Result<(), RemoteError> {
        match self.state {
            RemoteWriteState::Spawned(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(RemoteError::Unavailable(format!("remote write task failed: {err}"))),
            },
            RemoteWriteState::Ready(result) => result,
        }
    }
}

/// Outcome of an accepted create or update.
#[derive(Debug)]
pub struct MutationReceipt {
    /// Record as applied to the store.
    pub record: Record,
    pub remote: RemoteWrite,
}

/// Outcome of `create_project`.
#[derive(Debug)]
pub struct ProjectReceipt {
    pub project: MutationReceipt,
    /// Present when a client was synthesized for this project.
    pub client: Option<MutationReceipt>,
}

pub struct MutationCoordinator {
    store: Arc<SyncStore>,
    remote: Arc<dyn RemoteStore>,
    sanitizer: Sanitizer,
    clock: Arc<dyn Clock>,
    webhook: Option<Arc<dyn WebhookSink>>,
    webhook_events: BTreeSet<WebhookEvent>,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<SyncStore>,
        remote: Arc<dyn RemoteStore>,
        sanitizer: Sanitizer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            remote,
            sanitizer,
            clock,
            webhook: None,
            webhook_events: BTreeSet::new(),
        }
    }

    /// Delivers the selected events to `sink` after each matching mutation.
    pub fn with_webhook(
        mut self,
        sink: Arc<dyn WebhookSink>,
        events: impl IntoIterator<Item = WebhookEvent>,
    ) -> Self {
        self.webhook = Some(sink);
        self.webhook_events = events.into_iter().collect();
        self
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Creates `entity`, assigning a fresh id when it has none.
    pub fn create<E: Entity>(&self, mut entity: E) -> Result<MutationReceipt, ValidationError> {
        entity.validate()?;
        if entity.id().trim().is_empty() {
            entity.set_id(Uuid::new_v4().to_string());
        }
        self.upsert(&entity, Verb::Create)
    }

    /// Replaces the record with the same id, locally and remotely.
    pub fn update<E: Entity>(&self, entity: E) -> Result<MutationReceipt, ValidationError> {
        entity.validate()?;
        require_id::<E>(entity.id())?;
        self.upsert(&entity, Verb::Update)
    }

    /// Removes the record locally, then deletes it remotely.
    pub fn delete<E: Entity>(&self, id: &str) -> Result<RemoteWrite, ValidationError> {
        require_id::<E>(id)?;
        let id = id.trim().to_string();
        let collection = E::COLLECTION;
        self.store.apply(StoreEvent::Remove {
            slot: collection.slot(),
            id: id.clone(),
        });

        let remote = Arc::clone(&self.remote);
        let write_id = id.clone();
        let write = self.spawn_remote(Verb::Delete, collection, &id, async move {
            remote.delete_document(collection, &write_id).await
        });
        self.notify(collection, Verb::Delete, json!({ "id": id }));
        Ok(write)
    }

    /// Creates a project linked to a client matched by name or email,
    /// synthesizing the client first when none exists.
    pub fn create_project(&self, mut project: Project) -> Result<ProjectReceipt, ValidationError> {
        project.validate()?;

        let client = match self.find_client(&project.client_name, project.client_email.as_deref()) {
            Some(existing) => {
                debug!(
                    "event=client_link module=mutation status=ok client_id={} synthesized=false",
                    existing.id
                );
                project.client_id = Some(existing.id);
                None
            }
            None => {
                let mut client = Client::new(project.client_name.trim());
                client.email = trimmed(project.client_email.as_deref());
                client.phone = trimmed(project.client_phone.as_deref());
                client.address = trimmed(project.address.as_deref());
                let receipt = self.create(client)?;
                info!(
                    "event=client_link module=mutation status=ok client_id={} synthesized=true",
                    receipt.record.id
                );
                project.client_id = Some(receipt.record.id.clone());
                Some(receipt)
            }
        };

        let project = self.create(project)?;
        Ok(ProjectReceipt { project, client })
    }

    /// First client-view record whose name or email matches, ignoring case
    /// (full Unicode lowercasing) and surrounding whitespace.
    pub fn find_client(&self, name: &str, email: Option<&str>) -> Option<Record> {
        let name = folded(name);
        let email = email.map(folded).filter(|value| !value.is_empty());
        self.store
            .records(StateSlot::Clients)
            .into_iter()
            .find(|record| {
                let name_matches = !name.is_empty()
                    && record
                        .text("name")
                        .is_some_and(|candidate| folded(candidate) == name);
                let email_matches = email.as_deref().is_some_and(|email| {
                    record
                        .text("email")
                        .is_some_and(|candidate| folded(candidate) == email)
                });
                name_matches || email_matches
            })
    }

    /// Typed view of the records of `E`'s collection. Undecodable records are skipped.
    pub fn list<E: Entity>(&self) -> Vec<E> {
        self.store
            .records(E::COLLECTION.slot())
            .into_iter()
            .filter(|record| record.collection == E::COLLECTION)
            .filter_map(|record| match serde_json::from_value::<E>(record.to_value()) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    debug!(
                        "event=entity_decode module=mutation status=skipped entity={} id={} error={err}",
                        E::NAME,
                        record.id
                    );
                    None
                }
            })
            .collect()
    }

    fn upsert<E: Entity>(&self, entity: &E, verb: Verb) -> Result<MutationReceipt, ValidationError> {
        let started_at = Instant::now();
        let collection = E::COLLECTION;
        let record = self.to_record(entity)?;
        self.store.apply(StoreEvent::Upsert(record.clone()));

        let remote = Arc::clone(&self.remote);
        let payload = record.to_value();
        let id = record.id.clone();
        let write = self.spawn_remote(verb, collection, &record.id, async move {
            remote.set_document(collection, &id, payload).await
        });
        self.notify(collection, verb, record.to_value());

        debug!(
            "event=mutation_apply module=mutation status=ok verb={} collection={collection} id={} duration_ms={}",
            verb.as_str(),
            record.id,
            started_at.elapsed().as_millis()
        );
        Ok(MutationReceipt {
            record,
            remote: write,
        })
    }

    fn to_record<E: Entity>(&self, entity: &E) -> Result<Record, ValidationError> {
        let raw = serde_json::to_value(entity)
            .map_err(|err| ValidationError::single(E::NAME, "payload", err.to_string()))?;
        let payload = match self.sanitizer.sanitize_plain(&raw) {
            Some(Value::Object(map)) => map,
            _ => return Err(ValidationError::single(E::NAME, "payload", "must be an object")),
        };
        Record::from_payload(E::COLLECTION, payload, Origin::Local, self.clock.now())
            .ok_or_else(|| ValidationError::single(E::NAME, "id", "is required"))
    }

    fn spawn_remote<F>(&self, verb: Verb, collection: Collection, id: &str, write: F) -> RemoteWrite
    where
        F: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "event=remote_write module=mutation status=skipped verb={} collection={collection} id={id} reason=no_runtime",
                verb.as_str()
            );
            return RemoteWrite::ready(Err(RemoteError::Unavailable(
                "no async runtime for remote write".to_string(),
            )));
        };

        let id = id.to_string();
        let handle = runtime.spawn(async move {
            let started_at = Instant::now();
            let result = write.await;
            match &result {
                Ok(()) => debug!(
                    "event=remote_write module=mutation status=ok verb={} collection={collection} id={id} duration_ms={}",
                    verb.as_str(),
                    started_at.elapsed().as_millis()
                ),
                Err(err) => warn!(
                    "event=remote_write module=mutation status=error verb={} collection={collection} id={id} duration_ms={} error={err}",
                    verb.as_str(),
                    started_at.elapsed().as_millis()
                ),
            }
            result
        });
        RemoteWrite {
            state: RemoteWriteState::Spawned(handle),
        }
    }

    fn notify(&self, collection: Collection, verb: Verb, payload: Value) {
        let Some(event) = webhook_event(collection, verb) else {
            return;
        };
        let Some(sink) = self.webhook.as_ref() else {
            return;
        };
        if !self.webhook_events.contains(&event) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "event=webhook_deliver module=mutation status=skipped webhook_event={} reason=no_runtime",
                event.as_str()
            );
            return;
        };
        let sink = Arc::clone(sink);
        runtime.spawn(async move {
            match sink.deliver(event, &payload).await {
                Ok(()) => debug!(
                    "event=webhook_deliver module=mutation status=ok webhook_event={}",
                    event.as_str()
                ),
                Err(err) => warn!(
                    "event=webhook_deliver module=mutation status=error webhook_event={} error={err}",
                    event.as_str()
                ),
            }
        });
    }
}

fn require_id<E: Entity>(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::single(E::NAME, "id", "is required"));
    }
    Ok(())
}

fn folded(value: &str) -> String {
    value.trim().to_lowercase()
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::MutationCoordinator;
    use crate::clock::SystemClock;
    use crate::config::WebhookEvent;
    use crate::model::collection::{Collection, StateSlot};
    use crate::model::entity::{Client, Entity, Expense, Project};
    use crate::remote::{MemoryRemoteStore, RemoteStore, WriteKind};
    use crate::sanitize::Sanitizer;
    use crate::storage::{LocalStorage, MemoryLocalStorage};
    use crate::sync::scheduler::{DeferStrategy, PersistenceScheduler};
    use crate::sync::store::SyncStore;
    use crate::webhook::{WebhookError, WebhookSink};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(WebhookEvent, Value)>>,
    }

    #[async_trait]
    impl WebhookSink for RecordingSink {
        async fn deliver(&self, event: WebhookEvent, payload: &Value) -> Result<(), WebhookError> {
            self.delivered.lock().unwrap().push((event, payload.clone()));
            Ok(())
        }
    }

    fn coordinator(remote: &MemoryRemoteStore) -> MutationCoordinator {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
        let scheduler = PersistenceScheduler::new(
            storage,
            Sanitizer::default(),
            DeferStrategy::Timer(Duration::from_millis(500)),
        );
        MutationCoordinator::new(
            Arc::new(SyncStore::new(scheduler, "fieldops")),
            Arc::new(remote.clone()) as Arc<dyn RemoteStore>,
            Sanitizer::default(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn validation_failure_changes_nothing() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let mut project = Project::new("", "Acme");
        project.client_email = Some("not-an-email".to_string());

        let err = coordinator.create_project(project).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.field("name").is_some());
        assert!(coordinator.store().is_empty(StateSlot::Projects));
        assert!(coordinator.store().is_empty(StateSlot::Clients));
        assert!(remote.writes().is_empty());
    }

    #[tokio::test]
    async fn create_assigns_id_and_writes_remotely() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let expense = Expense {
            id: String::new(),
            project_id: "p1".to_string(),
            description: "Lumber".to_string(),
            amount: 120.5,
            date: None,
            category: None,
            extra: Default::default(),
        };

        let receipt = coordinator.create(expense).unwrap();
        assert!(!receipt.record.id.is_empty());
        assert!(coordinator
            .store()
            .get(StateSlot::Expenses, &receipt.record.id)
            .is_some());

        let id = receipt.record.id.clone();
        receipt.remote.settled().await.unwrap();
        assert_eq!(remote.document(Collection::Expenses, &id).unwrap()["amount"], json!(120.5));
    }

    #[tokio::test]
    async fn create_project_matches_client_by_name_ignoring_case() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let existing = coordinator.create(Client::new("Acme Builders")).unwrap();

        let receipt = coordinator
            .create_project(Project::new("Kitchen", "  acme BUILDERS "))
            .unwrap();
        assert!(receipt.client.is_none());
        assert_eq!(
            receipt.project.record.text("clientId"),
            Some(existing.record.id.as_str())
        );
        assert_eq!(coordinator.store().len(StateSlot::Clients), 1);
    }

    #[tokio::test]
    async fn client_match_folds_accented_capitals() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let first = coordinator
            .create_project(Project::new("Façade", "Élodie Bâtiment"))
            .unwrap();
        let client = first.client.unwrap();

        let second = coordinator
            .create_project(Project::new("Toiture", "ÉLODIE BÂTIMENT"))
            .unwrap();
        assert!(second.client.is_none());
        assert_eq!(
            second.project.record.text("clientId"),
            Some(client.record.id.as_str())
        );
        assert_eq!(coordinator.store().len(StateSlot::Clients), 1);
    }

    #[tokio::test]
    async fn delete_removes_locally_before_the_remote_call() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let created = coordinator.create(Client::new("Temp")).unwrap();
        created.remote.settled().await.unwrap();

        remote.fail_writes(true);
        let write = coordinator.delete::<Client>(&created.record.id).unwrap();
        assert!(coordinator.store().is_empty(StateSlot::Clients));
        assert!(write.settled().await.is_err());
        assert_eq!(remote.writes().last().unwrap().kind, WriteKind::Delete);
        assert!(coordinator.delete::<Client>("  ").is_err());
    }

    #[tokio::test]
    async fn update_requires_an_id() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        let err = coordinator.update(Client::new("No id")).unwrap_err();
        assert!(err.field("id").is_some());
    }

    #[tokio::test]
    async fn selected_webhook_events_are_delivered() {
        let remote = MemoryRemoteStore::new();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = coordinator(&remote).with_webhook(
            Arc::clone(&sink) as Arc<dyn WebhookSink>,
            [WebhookEvent::ProjectCreated],
        );

        let receipt = coordinator
            .create_project(Project::new("Deck", "Nora"))
            .unwrap();
        receipt.project.remote.settled().await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, WebhookEvent::ProjectCreated);
        assert_eq!(delivered[0].1["name"], json!("Deck"));
    }

    #[tokio::test]
    async fn list_decodes_typed_entities() {
        let remote = MemoryRemoteStore::new();
        let coordinator = coordinator(&remote);
        coordinator.create(Client::new("One")).unwrap();
        coordinator.create(Client::new("Two")).unwrap();
        let clients: Vec<Client> = coordinator.list();
        assert_eq!(clients.len(), 2);
        assert!(clients.iter().all(|client| !client.id().is_empty()));
    }
}
