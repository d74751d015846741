//! Live-query subscription manager.
//!
//! # Responsibility
//! - Open one live query per configured collection and pump its snapshots
//!   into the store: coerce to a list, sanitize, evaluate derived state,
//!   merge split sources, apply.
//! - Issue the remote write for derived status transitions.
//! - Close every live query on teardown.
//!
//! # Invariants
//! - Each snapshot is handed to the store as the full list of its source
//!   collection; the store owns the split-slot union.
//! - After `close_all` no snapshot reaches the store and no new remote write
//!   is issued.
//!
//! # See also
//! - `sync::derived` for the status transition rule.

use crate::clock::Clock;
use crate::config::{CollectionQuery, EmptySnapshotPolicy};
use crate::model::collection::Collection;
use crate::model::record::{Origin, Record};
use crate::remote::{LiveQuery, RemoteSnapshot, RemoteStore, SnapshotEvent};
use crate::sanitize::Sanitizer;
use crate::sync::derived::{DerivedStateEvaluator, StatusTransition};
use crate::sync::store::{ApplyOutcome, StoreEvent, SyncStore};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

#[derive(Default)]
struct ManagerState {
    closed: bool,
    tasks: Vec<AbortHandle>,
}

struct ManagerInner {
    remote: Arc<dyn RemoteStore>,
    store: Arc<SyncStore>,
    sanitizer: Sanitizer,
    evaluator: DerivedStateEvaluator,
    clock: Arc<dyn Clock>,
    policy: EmptySnapshotPolicy,
    state: Mutex<ManagerState>,
}

/// Session-scoped owner of every open live query.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<SyncStore>,
        sanitizer: Sanitizer,
        clock: Arc<dyn Clock>,
        policy: EmptySnapshotPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                remote,
                store,
                sanitizer,
                evaluator: DerivedStateEvaluator::new(),
                clock,
                policy,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn evaluator(&self) -> &DerivedStateEvaluator {
        &self.inner.evaluator
    }

    /// Opens a live query for every entry of `queries`. Returns how many opened.
    ///
    /// Failed subscriptions are logged and skipped. Requires a tokio runtime.
    pub fn open(&self, queries: &[CollectionQuery]) -> usize {
        let Ok(runtime) = Handle::try_current() else {
            warn!("event=subscription_open module=subscription status=skipped reason=no_runtime");
            return 0;
        };

        let mut opened = 0;
        for query in queries {
            let mut state = self.inner.lock_state();
            if state.closed {
                debug!("event=subscription_open module=subscription status=skipped reason=closed");
                break;
            }
            match self.inner.remote.subscribe(query) {
                Ok(live) => {
                    let task = runtime.spawn(pump(Arc::clone(&self.inner), live));
                    state.tasks.push(task.abort_handle());
                    opened += 1;
                    info!(
                        "event=subscription_open module=subscription status=ok collection={} filtered={} limit={:?}",
                        query.collection,
                        query.filter.is_some(),
                        query.limit
                    );
                }
                Err(err) => warn!(
                    "event=subscription_open module=subscription status=error collection={} error={err}",
                    query.collection
                ),
            }
        }
        opened
    }

    /// Live queries whose pump is still running.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock_state()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Closes every live query. Returns the number of pumps stopped.
    pub fn close_all(&self) -> usize {
        let tasks = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return 0;
            }
            state.closed = true;
            std::mem::take(&mut state.tasks)
        };
        for task in &tasks {
            task.abort();
        }
        info!(
            "event=subscription_close module=subscription status=ok closed={}",
            tasks.len()
        );
        tasks.len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn pump(inner: Arc<ManagerInner>, mut live: LiveQuery) {
    let collection = live.query().collection;
    while let Some(event) = live.next().await {
        match event {
            SnapshotEvent::Snapshot(snapshot) => inner.handle_snapshot(snapshot),
            SnapshotEvent::Error(err) => warn!(
                "event=subscription_event module=subscription status=error collection={collection} error={err}"
            ),
        }
        if inner.lock_state().closed {
            break;
        }
    }
    debug!("event=subscription_pump module=subscription status=ok collection={collection} ended=true");
    live.close();
}

impl ManagerInner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn accepts_empty(&self, from_cache: bool) -> bool {
        match self.policy {
            EmptySnapshotPolicy::AcceptConfirmed => !from_cache,
            EmptySnapshotPolicy::AlwaysGuard => false,
            EmptySnapshotPolicy::AcceptAll => true,
        }
    }

    fn handle_snapshot(self: &Arc<Self>, snapshot: RemoteSnapshot) {
        let started_at = Instant::now();
        let RemoteSnapshot {
            collection,
            docs,
            from_cache,
        } = snapshot;

        let (docs, coerced) = match self.sanitizer.sanitize(&docs) {
            Some(Value::Array(items)) => (items, false),
            _ => {
                warn!(
                    "event=subscription_snapshot module=subscription status=error collection={collection} reason=not_a_list"
                );
                (Vec::new(), true)
            }
        };

        let received = docs.len();
        let merged_at = self.clock.now();
        let mut records: Vec<Record> = docs
            .into_iter()
            .filter_map(|doc| match doc {
                Value::Object(payload) => {
                    Record::from_payload(collection, payload, Origin::Remote, merged_at)
                }
                _ => None,
            })
            .collect();
        if records.len() < received {
            debug!(
                "event=subscription_snapshot module=subscription status=skipped collection={collection} dropped={} reason=missing_id",
                received - records.len()
            );
        }

        let mut writes = Vec::new();
        if collection == Collection::Projects {
            let batch = self.evaluator.evaluate(records, self.clock.today());
            records = batch.records;
            writes = batch.writes;
        }

        let accept_empty = !coerced && self.accepts_empty(from_cache);
        let slot = collection.slot();
        let outcome = {
            let state = self.lock_state();
            if state.closed {
                debug!(
                    "event=subscription_snapshot module=subscription status=skipped collection={collection} reason=closed"
                );
                return;
            }
            self.store.apply(StoreEvent::SourceSnapshot {
                source: collection,
                records,
                accept_empty,
            })
        };

        for transition in writes {
            self.spawn_transition_write(transition);
        }

        debug!(
            "event=subscription_snapshot module=subscription status=ok collection={collection} slot={slot} count={received} from_cache={from_cache} applied={} guarded={} duration_ms={}",
            matches!(outcome, ApplyOutcome::Applied { .. }),
            outcome == ApplyOutcome::DiscardedEmpty,
            started_at.elapsed().as_millis()
        );
    }

    fn spawn_transition_write(self: &Arc<Self>, transition: StatusTransition) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let patch = json!({ "status": transition.to.as_str() });
            match inner
                .remote
                .merge_document(Collection::Projects, &transition.id, patch)
                .await
            {
                Ok(()) => info!(
                    "event=derived_write module=subscription status=ok id={} from={} to={}",
                    transition.id,
                    transition.from.as_str(),
                    transition.to.as_str()
                ),
                Err(err) => {
                    inner.evaluator.release(&transition.id);
                    warn!(
                        "event=derived_write module=subscription status=error id={} error={err}",
                        transition.id
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionManager;
    use crate::clock::FixedClock;
    use crate::config::{CollectionQuery, EmptySnapshotPolicy};
    use crate::model::collection::{Collection, StateSlot};
    use crate::model::record::{Origin, Record};
    use crate::remote::{MemoryRemoteStore, RemoteError, RemoteStore, WriteKind};
    use crate::sanitize::{LiveObject, LiveValue, Sanitizer};
    use crate::storage::{LocalStorage, MemoryLocalStorage};
    use crate::sync::scheduler::{DeferStrategy, PersistenceScheduler};
    use crate::sync::store::{StoreEvent, SyncStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        remote: MemoryRemoteStore,
        store: Arc<SyncStore>,
        manager: SubscriptionManager,
    }

    fn harness(policy: EmptySnapshotPolicy) -> Harness {
        let remote = MemoryRemoteStore::new();
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
        let scheduler = PersistenceScheduler::new(
            storage,
            Sanitizer::default(),
            DeferStrategy::Timer(Duration::from_millis(500)),
        );
        let store = Arc::new(SyncStore::new(scheduler, "fieldops"));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        ));
        let manager = SubscriptionManager::new(
            Arc::new(remote.clone()) as Arc<dyn RemoteStore>,
            Arc::clone(&store),
            Sanitizer::default(),
            clock,
            policy,
        );
        Harness {
            remote,
            store,
            manager,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn docs(value: serde_json::Value) -> LiveValue {
        LiveValue::from(value)
    }

    fn local_client(id: &str, name: &str) -> Record {
        let payload = json!({"id": id, "name": name}).as_object().cloned().unwrap();
        Record::from_payload(Collection::Clients, payload, Origin::Local, Utc::now()).unwrap()
    }

    fn client_ids(store: &SyncStore) -> Vec<String> {
        let mut ids: Vec<String> = store
            .records(StateSlot::Clients)
            .into_iter()
            .map(|record| record.id)
            .collect();
        ids.sort();
        ids
    }

    fn client_queries() -> Vec<CollectionQuery> {
        vec![
            CollectionQuery::all(Collection::Clients),
            CollectionQuery::all(Collection::Partners),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn split_sources_merge_by_id_with_later_emission_winning() {
        let h = harness(EmptySnapshotPolicy::default());
        assert_eq!(h.manager.open(&client_queries()), 2);
        settle().await;

        h.remote.emit_raw(
            Collection::Clients,
            docs(json!([{"id": "c1", "name": "from clients"}, {"id": "c2", "name": "only client"}])),
            false,
        );
        settle().await;
        h.remote.emit_raw(
            Collection::Partners,
            docs(json!([{"id": "c1", "name": "from partners"}, {"id": "p1", "name": "only partner"}])),
            false,
        );
        settle().await;

        assert_eq!(h.store.len(StateSlot::Clients), 3);
        let c1 = h.store.get(StateSlot::Clients, "c1").unwrap();
        assert_eq!(c1.text("name"), Some("from partners"));
        assert_eq!(c1.collection, Collection::Partners);

        h.remote.emit_raw(
            Collection::Clients,
            docs(json!([{"id": "c1", "name": "clients again"}])),
            false,
        );
        settle().await;
        assert_eq!(h.store.len(StateSlot::Clients), 2);
        assert!(h.store.get(StateSlot::Clients, "c2").is_none());
        assert_eq!(
            h.store.get(StateSlot::Clients, "c1").unwrap().text("name"),
            Some("clients again")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hydrated_clients_survive_empty_client_lists_while_partners_emit() {
        let h = harness(EmptySnapshotPolicy::AlwaysGuard);
        h.store.apply(StoreEvent::Hydrate {
            slot: StateSlot::Clients,
            records: vec![local_client("c1", "restored")],
        });
        h.remote
            .seed(Collection::Partners, [json!({"id": "p1", "name": "Partner"})]);
        h.manager.open(&client_queries());
        settle().await;
        assert_eq!(client_ids(&h.store), ["c1", "p1"]);

        h.remote
            .emit_raw(Collection::Clients, docs(json!([])), true);
        settle().await;
        assert_eq!(client_ids(&h.store), ["c1", "p1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_client_survives_a_partner_emission() {
        let h = harness(EmptySnapshotPolicy::default());
        h.manager.open(&client_queries());
        settle().await;

        h.store.apply(StoreEvent::Upsert(local_client("c-new", "Unconfirmed")));
        h.remote
            .seed(Collection::Partners, [json!({"id": "p9", "name": "Partner"})]);
        settle().await;
        assert_eq!(client_ids(&h.store), ["c-new", "p9"]);
        assert_eq!(
            h.store.get(StateSlot::Clients, "c-new").unwrap().origin,
            Origin::Local
        );

        h.store.apply(StoreEvent::Remove {
            slot: StateSlot::Clients,
            id: "c-new".to_string(),
        });
        h.remote
            .emit_raw(Collection::Partners, docs(json!([{"id": "p9", "name": "Partner"}])), false);
        settle().await;
        assert_eq!(client_ids(&h.store), ["p9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_list_payload_is_coerced_and_guarded() {
        let h = harness(EmptySnapshotPolicy::AcceptAll);
        h.remote
            .seed(Collection::Employees, [json!({"id": "e1", "name": "Ana"})]);
        h.manager.open(&[CollectionQuery::all(Collection::Employees)]);
        settle().await;
        assert_eq!(h.store.len(StateSlot::Employees), 1);

        let odd = LiveObject::from_pairs([("unexpected", LiveValue::from(true))]);
        h.remote.emit_raw(Collection::Employees, odd.into(), false);
        settle().await;
        assert_eq!(h.store.len(StateSlot::Employees), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_empty_snapshot_is_discarded_but_confirmed_one_applies() {
        let h = harness(EmptySnapshotPolicy::AcceptConfirmed);
        h.remote
            .seed(Collection::Expenses, [json!({"id": "x1", "amount": 10})]);
        h.manager.open(&[CollectionQuery::all(Collection::Expenses)]);
        settle().await;

        h.remote.emit_raw(Collection::Expenses, docs(json!([])), true);
        settle().await;
        assert_eq!(h.store.len(StateSlot::Expenses), 1);

        h.remote.emit_raw(Collection::Expenses, docs(json!([])), false);
        settle().await;
        assert!(h.store.is_empty(StateSlot::Expenses));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_project_is_promoted_and_written_once() {
        let h = harness(EmptySnapshotPolicy::default());
        h.remote.seed(
            Collection::Projects,
            [json!({"id": "p1", "name": "Roof", "status": "scheduled", "startDate": "2026-03-09"})],
        );
        h.manager.open(&[CollectionQuery::all(Collection::Projects)]);
        settle().await;
        settle().await;

        let project = h.store.get(StateSlot::Projects, "p1").unwrap();
        assert_eq!(project.text("status"), Some("active"));
        let merges: Vec<_> = h
            .remote
            .writes()
            .into_iter()
            .filter(|write| write.kind == WriteKind::Merge)
            .collect();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].payload, Some(json!({"status": "active"})));
        assert_eq!(h.manager.evaluator().in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_events_keep_the_query_open() {
        let h = harness(EmptySnapshotPolicy::default());
        h.manager.open(&[CollectionQuery::all(Collection::Prospects)]);
        settle().await;
        h.remote.emit_error(
            Collection::Prospects,
            RemoteError::Unavailable("offline".to_string()),
        );
        settle().await;
        h.remote
            .seed(Collection::Prospects, [json!({"id": "s1", "name": "Lead"})]);
        settle().await;
        assert_eq!(h.store.len(StateSlot::Prospects), 1);
        assert_eq!(h.manager.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_stops_every_callback() {
        let h = harness(EmptySnapshotPolicy::default());
        h.manager.open(&client_queries());
        settle().await;
        assert_eq!(h.remote.subscriber_count(), 2);

        assert_eq!(h.manager.close_all(), 2);
        settle().await;
        h.remote
            .seed(Collection::Clients, [json!({"id": "late", "name": "after logout"})]);
        settle().await;

        assert!(h.store.is_empty(StateSlot::Clients));
        assert_eq!(h.remote.subscriber_count(), 0);
        assert_eq!(h.manager.open(&client_queries()), 0);
    }
}
