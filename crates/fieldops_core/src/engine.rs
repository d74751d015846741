//! Session lifecycle of the sync engine.
//!
//! # Responsibility
//! - Wire storage, scheduler, store, subscriptions and mutations together.
//! - Drive `Created -> Hydrated -> Live -> Closed` and publish each state.
//!
//! # Invariants
//! - Live queries open only after local hydration and with a session user.
//! - Teardown cancels pending persistence and closes every live query; the
//!   engine cannot be reconnected afterwards.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::export::build_export;
use crate::model::collection::StateSlot;
use crate::model::record::{Origin, Record};
use crate::remote::RemoteStore;
use crate::sanitize::Sanitizer;
use crate::storage::{load_json, load_snapshot, store_json, LocalStorage, SqliteLocalStorage, StorageError};
use crate::sync::mutation::MutationCoordinator;
use crate::sync::scheduler::{IdleSignal, PersistenceScheduler};
use crate::sync::store::{StoreEvent, SyncStore};
use crate::sync::subscription::SubscriptionManager;
use crate::webhook::{HttpWebhook, WebhookError, WebhookSink};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Hydrated,
    Live,
    Closed,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Hydrated => "hydrated",
            Self::Live => "live",
            Self::Closed => "closed",
        }
    }
}

/// Authenticated user the session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl SessionUser {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Operation called in the wrong lifecycle state.
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
    /// Connecting requires an authenticated user.
    MissingUser,
    Storage(StorageError),
    Webhook(WebhookError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {operation} while engine is {}", state.as_str())
            }
            Self::MissingUser => write!(f, "no authenticated session user"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Webhook(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Webhook(err) => Some(err),
            Self::InvalidState { .. } | Self::MissingUser => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<WebhookError> for EngineError {
    fn from(value: WebhookError) -> Self {
        Self::Webhook(value)
    }
}

/// What `hydrate` restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationReport {
    pub slots: usize,
    pub records: usize,
    pub user: Option<SessionUser>,
}

pub struct EngineBuilder {
    config: SyncConfig,
    storage: Arc<dyn LocalStorage>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    idle: Option<Arc<dyn IdleSignal>>,
    webhook: Option<Arc<dyn WebhookSink>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables idle-time persistence; without it writes use the fallback timer.
    pub fn idle_signal(mut self, idle: Arc<dyn IdleSignal>) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn webhook(mut self, sink: Arc<dyn WebhookSink>) -> Self {
        self.webhook = Some(sink);
        self
    }

    pub fn build(self) -> SyncEngine {
        let sanitizer = Sanitizer::new(self.config.max_depth);
        let scheduler = PersistenceScheduler::with_defaults(
            Arc::clone(&self.storage),
            sanitizer,
            self.idle,
            self.config.idle_max_wait(),
            self.config.fallback_delay(),
        );
        let store = Arc::new(SyncStore::new(
            scheduler,
            self.config.storage_key_prefix.clone(),
        ));

        let mut mutations = MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&self.remote),
            sanitizer,
            Arc::clone(&self.clock),
        );
        if let Some(sink) = self.webhook {
            mutations = mutations.with_webhook(sink, self.config.webhook.events.iter().copied());
        }
        let subscriptions = SubscriptionManager::new(
            self.remote,
            Arc::clone(&store),
            sanitizer,
            Arc::clone(&self.clock),
            self.config.empty_snapshot_policy,
        );
        let (state, _) = watch::channel(EngineState::Created);

        SyncEngine {
            config: self.config,
            storage: self.storage,
            sanitizer,
            clock: Arc::clone(&self.clock),
            store,
            mutations,
            subscriptions,
            state,
            session: Mutex::new(None),
        }
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    storage: Arc<dyn LocalStorage>,
    sanitizer: Sanitizer,
    clock: Arc<dyn Clock>,
    store: Arc<SyncStore>,
    mutations: MutationCoordinator,
    subscriptions: SubscriptionManager,
    state: watch::Sender<EngineState>,
    session: Mutex<Option<SessionUser>>,
}

impl SyncEngine {
    pub fn builder(
        config: SyncConfig,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            storage,
            remote,
            clock: Arc::new(SystemClock),
            idle: None,
            webhook: None,
        }
    }

    /// Engine over the SQLite store at `config.resolved_db_path()`, with the
    /// HTTP webhook when an endpoint is configured.
    pub fn open(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, EngineError> {
        let storage = SqliteLocalStorage::open(config.resolved_db_path(), config.storage_quota_bytes)?;
        let webhook = HttpWebhook::from_config(&config.webhook)?;
        let mut builder = Self::builder(config, Arc::new(storage), remote);
        if let Some(webhook) = webhook {
            builder = builder.webhook(Arc::new(webhook));
        }
        Ok(builder.build())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    /// Export document of the in-memory `slots`, sanitized at the configured depth.
    pub fn export(&self, slots: &[StateSlot]) -> Value {
        build_export(&self.store, &self.sanitizer, slots, self.clock.now())
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn session_user(&self) -> Option<SessionUser> {
        self.lock_session().clone()
    }

    /// Restores every slot and the session user from local storage.
    pub fn hydrate(&self) -> Result<HydrationReport, EngineError> {
        self.expect_state("hydrate", EngineState::Created)?;
        let prefix = &self.config.storage_key_prefix;
        let mut slots = 0;
        let mut restored = 0;

        for slot in StateSlot::all() {
            let Some(rows) = load_snapshot(self.storage.as_ref(), &slot.storage_key(prefix)) else {
                continue;
            };
            let collection = slot.sources()[0];
            let merged_at = self.clock.now();
            let records: Vec<Record> = rows
                .iter()
                .filter_map(|row| match self.sanitizer.sanitize_plain(row)? {
                    Value::Object(payload) => {
                        Record::from_payload(collection, payload, Origin::Local, merged_at)
                    }
                    _ => None,
                })
                .collect();
            slots += 1;
            restored += records.len();
            self.store.apply(StoreEvent::Hydrate {
                slot: *slot,
                records,
            });
        }

        let user = load_json(self.storage.as_ref(), &self.config.session_user_key).and_then(
            |value| match serde_json::from_value::<SessionUser>(value) {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!("event=engine_hydrate module=engine status=error reason=session_user error={err}");
                    None
                }
            },
        );
        *self.lock_session() = user.clone();

        self.state.send_replace(EngineState::Hydrated);
        info!(
            "event=engine_hydrate module=engine status=ok slots={slots} records={restored} session_user={}",
            user.is_some()
        );
        Ok(HydrationReport {
            slots,
            records: restored,
            user,
        })
    }

    /// Stores `user` as the session user and opens every configured live query.
    pub fn connect(&self, user: SessionUser) -> Result<usize, EngineError> {
        self.expect_state("connect", EngineState::Hydrated)?;
        if user.uid.trim().is_empty() {
            return Err(EngineError::MissingUser);
        }
        match serde_json::to_value(&user) {
            Ok(value) => {
                if let Err(err) = store_json(self.storage.as_ref(), &self.config.session_user_key, &value) {
                    warn!("event=engine_connect module=engine status=error reason=session_user error={err}");
                }
            }
            Err(err) => warn!("event=engine_connect module=engine status=error reason=session_user error={err}"),
        }
        *self.lock_session() = Some(user);

        let opened = self.subscriptions.open(&self.config.queries);
        self.state.send_replace(EngineState::Live);
        info!(
            "event=engine_connect module=engine status=ok queries={opened} configured={}",
            self.config.queries.len()
        );
        Ok(opened)
    }

    /// Connects with the session user restored by `hydrate`.
    pub fn resume(&self) -> Result<usize, EngineError> {
        let user = self.session_user().ok_or(EngineError::MissingUser)?;
        self.connect(user)
    }

    /// Writes every pending snapshot now. Returns the number of keys written.
    pub fn flush(&self) -> usize {
        self.store.scheduler().flush()
    }

    /// Ends the session. Safe to call more than once.
    pub fn teardown(&self) {
        if self.state() == EngineState::Closed {
            return;
        }
        let cancelled = self.store.scheduler().cancel_all();
        let closed = self.subscriptions.close_all();
        *self.lock_session() = None;
        if let Err(err) = self.storage.remove(&self.config.session_user_key) {
            warn!("event=engine_teardown module=engine status=error reason=session_user error={err}");
        }
        self.state.send_replace(EngineState::Closed);
        info!(
            "event=engine_teardown module=engine status=ok cancelled_writes={cancelled} closed_queries={closed}"
        );
    }

    fn expect_state(&self, operation: &'static str, expected: EngineState) -> Result<(), EngineError> {
        let state = self.state();
        if state != expected {
            return Err(EngineError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<SessionUser>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineError, EngineState, SessionUser, SyncEngine};
    use crate::config::SyncConfig;
    use crate::model::collection::{Collection, StateSlot};
    use crate::model::record::{Origin, Record};
    use crate::remote::{MemoryRemoteStore, RemoteStore};
    use crate::storage::{store_json, LocalStorage, MemoryLocalStorage};
    use crate::sync::store::StoreEvent;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn engine(storage: Arc<MemoryLocalStorage>) -> SyncEngine {
        SyncEngine::builder(
            SyncConfig::default(),
            storage as Arc<dyn LocalStorage>,
            Arc::new(MemoryRemoteStore::new()) as Arc<dyn RemoteStore>,
        )
        .build()
    }

    #[test]
    fn hydrate_restores_slots_and_session_user() {
        let storage = Arc::new(MemoryLocalStorage::new());
        store_json(
            storage.as_ref(),
            "fieldops.projects.backup",
            &json!([{"id": "p1", "name": "Roof"}, {"name": "no id"}]),
        )
        .unwrap();
        storage.set("fieldops.clients.backup", "{not json").unwrap();
        store_json(storage.as_ref(), "fieldops.session.user", &json!({"uid": "u1"})).unwrap();

        let engine = engine(Arc::clone(&storage));
        let report = engine.hydrate().unwrap();
        assert_eq!(report.slots, 1);
        assert_eq!(report.records, 1);
        assert_eq!(report.user, Some(SessionUser::new("u1")));
        assert_eq!(engine.store().len(StateSlot::Projects), 1);
        assert_eq!(engine.state(), EngineState::Hydrated);
    }

    #[test]
    fn export_uses_the_configured_depth() {
        let config = SyncConfig {
            max_depth: 2,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::builder(
            config,
            Arc::new(MemoryLocalStorage::new()) as Arc<dyn LocalStorage>,
            Arc::new(MemoryRemoteStore::new()) as Arc<dyn RemoteStore>,
        )
        .build();
        let payload = json!({"id": "p1", "site": {"gate": {"code": "1234"}}})
            .as_object()
            .cloned()
            .unwrap();
        let record =
            Record::from_payload(Collection::Projects, payload, Origin::Remote, Utc::now()).unwrap();
        engine.store().apply(StoreEvent::Upsert(record));

        let document = engine.export(&[StateSlot::Projects]);
        assert_eq!(
            document["collections"]["projects"],
            json!([{"id": "p1", "site": {"gate": {}}}])
        );
    }

    #[test]
    fn connect_requires_hydration_and_a_user() {
        let engine = engine(Arc::new(MemoryLocalStorage::new()));
        assert!(matches!(
            engine.connect(SessionUser::new("u1")),
            Err(EngineError::InvalidState {
                state: EngineState::Created,
                ..
            })
        ));
        engine.hydrate().unwrap();
        assert!(matches!(engine.resume(), Err(EngineError::MissingUser)));
        assert!(matches!(
            engine.connect(SessionUser::new("  ")),
            Err(EngineError::MissingUser)
        ));
        assert!(matches!(
            engine.hydrate(),
            Err(EngineError::InvalidState { .. })
        ));
    }
}
