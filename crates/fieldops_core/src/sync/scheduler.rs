//! Coalescing persistence scheduler.
//!
//! # Responsibility
//! - Defer local snapshot writes until the foreground context is idle,
//!   bounded by a maximum wait, or after a fixed fallback delay.
//! - Keep at most one pending write per key; a newer value cancels the older
//!   pending write.
//!
//! # Invariants
//! - Write failures are logged and dropped, never propagated.
//! - The pending-write table is owned by the scheduler instance and lives as
//!   long as the session that created it.
//! - A task only writes after claiming its own ticket, so a superseded task
//!   can never overwrite a newer value.

use crate::sanitize::Sanitizer;
use crate::storage::{store_json, LocalStorage};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Source of "foreground is idle" notifications.
#[async_trait]
pub trait IdleSignal: Send + Sync {
    /// Resolves once the foreground context has no queued work.
    async fn idle(&self);
}

/// Treats the next scheduler turn as idle: resolves after every task that
/// was already ready has been polled once.
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldIdle;

#[async_trait]
impl IdleSignal for YieldIdle {
    async fn idle(&self) {
        tokio::task::yield_now().await;
    }
}

/// How a deferred write waits before running.
#[derive(Clone)]
pub enum DeferStrategy {
    /// Wait for idle, but never longer than `max_wait`.
    Idle {
        signal: Arc<dyn IdleSignal>,
        max_wait: Duration,
    },
    /// Fixed timer delay.
    Timer(Duration),
}

impl DeferStrategy {
    async fn wait(&self) {
        match self {
            Self::Idle { signal, max_wait } => {
                let _ = tokio::time::timeout(*max_wait, signal.idle()).await;
            }
            Self::Timer(delay) => tokio::time::sleep(*delay).await,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Timer(_) => "timer",
        }
    }
}

struct PendingWrite {
    ticket: u64,
    value: Value,
    handle: AbortHandle,
}

struct SchedulerInner {
    storage: Arc<dyn LocalStorage>,
    sanitizer: Sanitizer,
    strategy: DeferStrategy,
    pending: Mutex<HashMap<String, PendingWrite>>,
    next_ticket: AtomicU64,
}

/// Session-scoped scheduler. Clones share the same pending table.
#[derive(Clone)]
pub struct PersistenceScheduler {
    inner: Arc<SchedulerInner>,
}

impl PersistenceScheduler {
    pub fn new(storage: Arc<dyn LocalStorage>, sanitizer: Sanitizer, strategy: DeferStrategy) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                storage,
                sanitizer,
                strategy,
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Idle-time scheduling when `idle` is available, fixed timer otherwise.
    pub fn with_defaults(
        storage: Arc<dyn LocalStorage>,
        sanitizer: Sanitizer,
        idle: Option<Arc<dyn IdleSignal>>,
        max_wait: Duration,
        fallback_delay: Duration,
    ) -> Self {
        let strategy = match idle {
            Some(signal) => DeferStrategy::Idle { signal, max_wait },
            None => DeferStrategy::Timer(fallback_delay),
        };
        Self::new(storage, sanitizer, strategy)
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.inner.storage
    }

    /// Schedules `value` to be written under `key`, replacing any pending write.
    ///
    /// Outside a tokio runtime the write happens immediately.
    pub fn schedule(&self, key: &str, value: Value) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("event=persist_schedule module=scheduler status=skipped key={key} reason=no_runtime");
            self.inner.write(key, &value);
            return;
        };

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.inner.lock_pending();

        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let handle = runtime.spawn(async move {
            inner.strategy.wait().await;
            if let Some(value) = inner.claim(&task_key, ticket) {
                inner.write(&task_key, &value);
            }
        });

        let replaced = pending.insert(
            key.to_string(),
            PendingWrite {
                ticket,
                value,
                handle: handle.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.handle.abort();
            debug!(
                "event=persist_schedule module=scheduler status=ok key={key} coalesced=true strategy={}",
                self.inner.strategy.label()
            );
        } else {
            debug!(
                "event=persist_schedule module=scheduler status=ok key={key} coalesced=false strategy={}",
                self.inner.strategy.label()
            );
        }
    }

    /// Number of keys with a pending write.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.lock_pending().contains_key(key)
    }

    /// Cancels every pending write without writing. Returns the count.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingWrite> = self.inner.lock_pending().drain().map(|(_, v)| v).collect();
        for write in &drained {
            write.handle.abort();
        }
        if !drained.is_empty() {
            debug!(
                "event=persist_cancel module=scheduler status=ok cancelled={}",
                drained.len()
            );
        }
        drained.len()
    }

    /// Runs every pending write now. Returns the number of keys written or attempted.
    pub fn flush(&self) -> usize {
        let drained: Vec<(String, PendingWrite)> = self.inner.lock_pending().drain().collect();
        for (key, write) in &drained {
            write.handle.abort();
            self.inner.write(key, &write.value);
        }
        drained.len()
    }
}

impl SchedulerInner {
    // A poisoned table only means a writer panicked mid-insert; the map is still usable.
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingWrite>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes the pending entry for `key` if it still belongs to `ticket`.
    fn claim(&self, key: &str, ticket: u64) -> Option<Value> {
        let mut pending = self.lock_pending();
        match pending.get(key) {
            Some(write) if write.ticket == ticket => pending.remove(key).map(|write| write.value),
            _ => None,
        }
    }

    fn write(&self, key: &str, value: &Value) {
        let started_at = Instant::now();
        let sanitized = match value {
            Value::Array(items) => Some(Value::Array(self.sanitizer.sanitize_items(items))),
            other => self.sanitizer.sanitize_plain(other),
        };
        let Some(plain) = sanitized else {
            warn!("event=persist_write module=scheduler status=skipped key={key} reason=unserializable");
            return;
        };
        match store_json(self.storage.as_ref(), key, &plain) {
            Ok(()) => debug!(
                "event=persist_write module=scheduler status=ok key={key} duration_ms={}",
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=persist_write module=scheduler status=error key={key} duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeferStrategy, IdleSignal, PersistenceScheduler};
    use crate::sanitize::Sanitizer;
    use crate::storage::{load_json, LocalStorage, MemoryLocalStorage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct NeverIdle;

    #[async_trait]
    impl IdleSignal for NeverIdle {
        async fn idle(&self) {
            std::future::pending::<()>().await;
        }
    }

    fn timer_scheduler(storage: Arc<MemoryLocalStorage>) -> PersistenceScheduler {
        PersistenceScheduler::new(
            storage,
            Sanitizer::default(),
            DeferStrategy::Timer(Duration::from_millis(500)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_schedules_coalesce_into_the_last_value() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = timer_scheduler(Arc::clone(&storage));

        for version in 1..=5 {
            scheduler.schedule("projects", json!([{"id": "p", "v": version}]));
        }
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(storage.write_count(), 1);
        assert_eq!(
            load_json(storage.as_ref(), "projects"),
            Some(json!([{"id": "p", "v": 5}]))
        );
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_is_bounded_by_max_wait() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = PersistenceScheduler::new(
            Arc::clone(&storage) as Arc<dyn LocalStorage>,
            Sanitizer::default(),
            DeferStrategy::Idle {
                signal: Arc::new(NeverIdle),
                max_wait: Duration::from_millis(1_000),
            },
        );

        scheduler.schedule("k", json!([1]));
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(storage.write_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_are_written_independently() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = timer_scheduler(Arc::clone(&storage));
        scheduler.schedule("a", json!([1]));
        scheduler.schedule("b", json!([2]));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_are_swallowed() {
        let storage = Arc::new(MemoryLocalStorage::new());
        storage.fail_writes(true);
        let scheduler = timer_scheduler(Arc::clone(&storage));
        scheduler.schedule("k", json!([1]));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.write_count(), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_drops_pending_writes() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = timer_scheduler(Arc::clone(&storage));
        scheduler.schedule("a", json!([1]));
        scheduler.schedule("b", json!([2]));
        assert_eq!(scheduler.cancel_all(), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_values_immediately() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = timer_scheduler(Arc::clone(&storage));
        scheduler.schedule("a", json!([{"id": "1", "__internal": true}]));
        assert_eq!(scheduler.flush(), 1);
        assert_eq!(load_json(storage.as_ref(), "a"), Some(json!([{"id": "1"}])));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn records_at_the_depth_limit_survive_the_list_wrapper() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = PersistenceScheduler::new(
            Arc::clone(&storage) as Arc<dyn LocalStorage>,
            Sanitizer::new(3),
            DeferStrategy::Timer(Duration::from_millis(500)),
        );
        let record = json!({"id": "r", "a": {"b": {"c": 1}}});
        assert_eq!(Sanitizer::new(3).sanitize_plain(&record), Some(record.clone()));

        scheduler.schedule("k", json!([record.clone()]));
        assert_eq!(load_json(storage.as_ref(), "k"), Some(json!([record])));
    }

    #[test]
    fn schedule_outside_runtime_writes_inline() {
        let storage = Arc::new(MemoryLocalStorage::new());
        let scheduler = timer_scheduler(Arc::clone(&storage));
        scheduler.schedule("k", json!([1]));
        assert_eq!(storage.write_count(), 1);
    }
}
