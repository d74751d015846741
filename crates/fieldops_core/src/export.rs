//! Administrator bulk export.
//!
//! # Responsibility
//! - Bundle several slots into one JSON document, serialized through the
//!   same sanitizer the engine uses everywhere else.
//!
//! # Invariants
//! - Slots are listed in the order requested; missing slots export as `[]`.
//! - Export never fails on content; only writing the file can fail.

use crate::model::collection::StateSlot;
use crate::sanitize::{format_timestamp, Sanitizer};
use crate::storage::{load_snapshot, LocalStorage};
use crate::sync::store::SyncStore;
use chrono::{DateTime, Utc};
use log::info;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const EXPORT_FORMAT: &str = "fieldops-export/v1";

#[derive(Debug)]
pub enum ExportError {
    Io { path: PathBuf, source: std::io::Error },
    Serialize(serde_json::Error),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to write export `{}`: {source}", path.display())
            }
            Self::Serialize(err) => write!(f, "failed to encode export: {err}"),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(err) => Some(err),
        }
    }
}

/// Export of the in-memory store.
pub fn build_export(
    store: &SyncStore,
    sanitizer: &Sanitizer,
    slots: &[StateSlot],
    exported_at: DateTime<Utc>,
) -> Value {
    assemble(sanitizer, slots, exported_at, |slot| {
        store
            .records(slot)
            .iter()
            .map(|record| record.to_value())
            .collect()
    })
}

/// Export of the persisted local snapshots, without a running engine.
pub fn build_export_from_storage(
    storage: &dyn LocalStorage,
    key_prefix: &str,
    sanitizer: &Sanitizer,
    slots: &[StateSlot],
    exported_at: DateTime<Utc>,
) -> Value {
    assemble(sanitizer, slots, exported_at, |slot| {
        load_snapshot(storage, &slot.storage_key(key_prefix)).unwrap_or_default()
    })
}

fn assemble(
    sanitizer: &Sanitizer,
    slots: &[StateSlot],
    exported_at: DateTime<Utc>,
    mut rows: impl FnMut(StateSlot) -> Vec<Value>,
) -> Value {
    let mut collections = Map::new();
    for slot in slots {
        let plain = sanitizer.sanitize_items(&rows(*slot));
        collections.insert(slot.name().to_string(), Value::Array(plain));
    }

    let mut document = Map::new();
    document.insert(
        "exportedAt".to_string(),
        Value::String(format_timestamp(&exported_at)),
    );
    document.insert("format".to_string(), Value::String(EXPORT_FORMAT.to_string()));
    document.insert("collections".to_string(), Value::Object(collections));
    Value::Object(document)
}

/// Writes `document` as pretty JSON.
pub fn write_export(path: impl AsRef<Path>, document: &Value) -> Result<(), ExportError> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(document).map_err(ExportError::Serialize)?;
    std::fs::write(path, text.as_bytes()).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        "event=export_write module=export status=ok bytes={} path={}",
        text.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{build_export_from_storage, write_export, EXPORT_FORMAT};
    use crate::model::collection::StateSlot;
    use crate::sanitize::Sanitizer;
    use crate::storage::{store_json, MemoryLocalStorage};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn export_bundles_requested_slots_in_order() {
        let storage = MemoryLocalStorage::new();
        store_json(
            &storage,
            "fieldops.projects.backup",
            &json!([{"id": "p1", "name": "Roof", "__internal": 1}]),
        )
        .unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let doc = build_export_from_storage(
            &storage,
            "fieldops",
            &Sanitizer::default(),
            &[StateSlot::Projects, StateSlot::Expenses],
            at,
        );
        assert_eq!(doc["format"], json!(EXPORT_FORMAT));
        assert_eq!(doc["exportedAt"], json!("2026-02-01T00:00:00.000Z"));
        assert_eq!(doc["collections"]["projects"], json!([{"id": "p1", "name": "Roof"}]));
        assert_eq!(doc["collections"]["expenses"], json!([]));
        let names: Vec<&String> = doc["collections"].as_object().unwrap().keys().collect();
        assert_eq!(names, ["projects", "expenses"]);
    }

    #[test]
    fn export_honours_the_configured_depth() {
        let storage = MemoryLocalStorage::new();
        store_json(
            &storage,
            "fieldops.projects.backup",
            &json!([{"id": "p1", "site": {"gate": {"code": "1234"}}}]),
        )
        .unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let shallow = build_export_from_storage(
            &storage,
            "fieldops",
            &Sanitizer::new(2),
            &[StateSlot::Projects],
            at,
        );
        assert_eq!(
            shallow["collections"]["projects"],
            json!([{"id": "p1", "site": {"gate": {}}}])
        );

        let full = build_export_from_storage(
            &storage,
            "fieldops",
            &Sanitizer::new(3),
            &[StateSlot::Projects],
            at,
        );
        assert_eq!(full["collections"]["projects"][0]["site"]["gate"]["code"], json!("1234"));
    }

    #[test]
    fn write_export_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let doc = json!({"format": EXPORT_FORMAT, "collections": {}});
        write_export(&path, &doc).unwrap();
        let read: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, doc);

        assert!(write_export(dir.path().join("missing/dir/export.json"), &doc).is_err());
    }
}
