//! Client-side synchronization and sanitization engine for FieldOps.
//! Keeps in-memory state, local durable storage and the remote real-time
//! store consistent under unreliable connectivity.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod export;
pub mod logging;
pub mod model;
pub mod remote;
pub mod sanitize;
pub mod storage;
pub mod sync;
pub mod webhook;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{CollectionQuery, ConfigError, EmptySnapshotPolicy, SyncConfig, WebhookEvent};
pub use engine::{EngineBuilder, EngineError, EngineState, HydrationReport, SessionUser, SyncEngine};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::collection::{Collection, StateSlot};
pub use model::entity::{
    AttendanceRecord, Client, Employee, Entity, Expense, Project, ProjectStatus, Prospect,
};
pub use model::record::{Origin, Payload, Record};
pub use model::validation::{FieldViolation, ValidationError};
pub use remote::{LiveQuery, MemoryRemoteStore, RemoteError, RemoteSnapshot, RemoteStore, SnapshotEvent};
pub use sanitize::{sanitize, LiveValue, Sanitizer};
pub use storage::{LocalStorage, MemoryLocalStorage, SqliteLocalStorage, StorageError};
pub use sync::mutation::{MutationCoordinator, MutationReceipt, ProjectReceipt, RemoteWrite};
pub use sync::scheduler::PersistenceScheduler;
pub use sync::store::{ApplyOutcome, StoreEvent, SyncStore};
pub use sync::subscription::SubscriptionManager;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
