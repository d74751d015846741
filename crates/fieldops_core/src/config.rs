//! Engine configuration.
//!
//! # Responsibility
//! - Hold every tunable the sync engine reads, with production defaults.
//! - Load from JSON and apply environment overrides.
//!
//! # Invariants
//! - Every field has a default; an empty JSON object is a valid config.
//! - Durations are expressed in milliseconds in serialized form.

use crate::model::collection::Collection;
use crate::sanitize::DEFAULT_MAX_DEPTH;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DB_PATH: &str = "FIELDOPS_DB_PATH";
pub const ENV_WEBHOOK_URL: &str = "FIELDOPS_WEBHOOK_URL";
pub const ENV_LOG_LEVEL: &str = "FIELDOPS_LOG_LEVEL";

const DEFAULT_DB_FILE_NAME: &str = "fieldops_local.sqlite3";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
        }
    }
}

/// What to do with an empty snapshot when the slot already holds records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptySnapshotPolicy {
    /// Accept the empty list only when it was confirmed by the server.
    #[default]
    AcceptConfirmed,
    /// Always keep prior non-empty state.
    AlwaysGuard,
    /// Always accept.
    AcceptAll,
}

/// Outbound webhook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "project.created")]
    ProjectCreated,
    #[serde(rename = "project.updated")]
    ProjectUpdated,
    #[serde(rename = "project.deleted")]
    ProjectDeleted,
    #[serde(rename = "client.created")]
    ClientCreated,
    #[serde(rename = "expense.created")]
    ExpenseCreated,
    #[serde(rename = "prospect.created")]
    ProspectCreated,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectCreated => "project.created",
            Self::ProjectUpdated => "project.updated",
            Self::ProjectDeleted => "project.deleted",
            Self::ClientCreated => "client.created",
            Self::ExpenseCreated => "expense.created",
            Self::ProspectCreated => "prospect.created",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub endpoint: Option<String>,
    pub events: BTreeSet<WebhookEvent>,
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            events: [WebhookEvent::ProjectCreated, WebhookEvent::ClientCreated]
                .into_iter()
                .collect(),
            timeout_ms: 5_000,
        }
    }
}

/// Sort direction for a live query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Live query definition for one remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionQuery {
    pub collection: Collection,
    /// Equality filter `(field, value)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<(String, Value)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<(String, SortDirection)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl CollectionQuery {
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            filter: None,
            order_by: None,
            limit: None,
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter = Some((field.into(), value));
        self
    }

    pub fn with_order(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

fn default_queries() -> Vec<CollectionQuery> {
    vec![
        CollectionQuery::all(Collection::Projects),
        CollectionQuery::all(Collection::Clients),
        CollectionQuery::all(Collection::Partners),
        CollectionQuery::all(Collection::Employees),
        CollectionQuery::all(Collection::Expenses),
        CollectionQuery::all(Collection::Attendance),
        CollectionQuery::all(Collection::Prospects),
        CollectionQuery::all(Collection::Notifications)
            .with_order("createdAt", SortDirection::Desc)
            .with_limit(100),
        CollectionQuery::all(Collection::Users),
        CollectionQuery::all(Collection::TeamMessages)
            .with_order("createdAt", SortDirection::Desc)
            .with_limit(200),
        CollectionQuery::all(Collection::Company),
    ]
}

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub db_path: Option<PathBuf>,
    pub storage_key_prefix: String,
    pub session_user_key: String,
    pub max_depth: usize,
    /// Upper bound for idle-time persistence scheduling.
    pub idle_max_wait_ms: u64,
    /// Timer delay when no idle signal is available.
    pub fallback_delay_ms: u64,
    /// Largest serialized entry accepted by local storage.
    pub storage_quota_bytes: usize,
    pub empty_snapshot_policy: EmptySnapshotPolicy,
    pub queries: Vec<CollectionQuery>,
    pub webhook: WebhookConfig,
    pub log_level: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            storage_key_prefix: "fieldops".to_string(),
            session_user_key: "fieldops.session.user".to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            idle_max_wait_ms: 1_000,
            fallback_delay_ms: 500,
            storage_quota_bytes: 5 * 1024 * 1024,
            empty_snapshot_policy: EmptySnapshotPolicy::default(),
            queries: default_queries(),
            webhook: WebhookConfig::default(),
            log_level: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Applies `FIELDOPS_*` environment overrides. Blank values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(path) = read(ENV_DB_PATH) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(url) = read(ENV_WEBHOOK_URL) {
            self.webhook.endpoint = Some(url);
        }
        if let Some(level) = read(ENV_LOG_LEVEL) {
            self.log_level = Some(level);
        }
        self
    }

    /// Resolved local database path; defaults to the temp directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DB_FILE_NAME))
    }

    pub fn idle_max_wait(&self) -> Duration {
        Duration::from_millis(self.idle_max_wait_ms)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{EmptySnapshotPolicy, SyncConfig, WebhookEvent, ENV_DB_PATH, ENV_WEBHOOK_URL};
    use crate::model::collection::Collection;
    use std::path::PathBuf;

    #[test]
    fn empty_object_yields_defaults() {
        let config = SyncConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.max_depth, 20);
        assert_eq!(config.idle_max_wait_ms, 1_000);
        assert_eq!(config.fallback_delay_ms, 500);
    }

    #[test]
    fn partial_json_overrides_selected_fields() {
        let config = SyncConfig::from_json_str(
            r#"{
                "empty_snapshot_policy": "always_guard",
                "webhook": {"endpoint": "https://hooks.example/x", "events": ["project.updated"]},
                "queries": [{"collection": "projects", "limit": 10}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.empty_snapshot_policy, EmptySnapshotPolicy::AlwaysGuard);
        assert!(config.webhook.events.contains(&WebhookEvent::ProjectUpdated));
        assert_eq!(config.queries.len(), 1);
        assert_eq!(config.queries[0].collection, Collection::Projects);
        assert_eq!(config.queries[0].limit, Some(10));
    }

    #[test]
    fn overrides_ignore_blank_values() {
        let config = SyncConfig::default().with_overrides(|name| match name {
            ENV_DB_PATH => Some(" /data/fieldops.sqlite3 ".to_string()),
            ENV_WEBHOOK_URL => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config.db_path, Some(PathBuf::from("/data/fieldops.sqlite3")));
        assert_eq!(config.webhook.endpoint, None);
    }
}
