//! Tolerant readers/writers for persisted snapshots.

use super::{LocalStorage, StorageResult};
use log::warn;
use serde_json::Value;

/// Loads a JSON value stored under `key`.
///
/// Missing keys, read failures and malformed text all yield `None`; the
/// latter two are logged.
pub fn load_json(storage: &dyn LocalStorage, key: &str) -> Option<Value> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!("event=snapshot_load module=storage status=error key={key} error={err}");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "event=snapshot_load module=storage status=error key={key} error_code=malformed error={err}"
            );
            None
        }
    }
}

/// Loads a whole-collection snapshot; non-array content is treated as absent.
pub fn load_snapshot(storage: &dyn LocalStorage, key: &str) -> Option<Vec<Value>> {
    match load_json(storage, key)? {
        Value::Array(items) => Some(items),
        _ => {
            warn!(
                "event=snapshot_load module=storage status=error key={key} error_code=not_an_array"
            );
            None
        }
    }
}

/// Serializes and stores `value`, replacing the previous entry.
pub fn store_json(storage: &dyn LocalStorage, key: &str, value: &Value) -> StorageResult<()> {
    let text = serde_json::to_string(value)?;
    storage.set(key, &text)
}

#[cfg(test)]
mod tests {
    use super::{load_json, load_snapshot, store_json};
    use crate::storage::{LocalStorage, MemoryLocalStorage};
    use serde_json::json;

    #[test]
    fn malformed_text_is_absent() {
        let storage = MemoryLocalStorage::new();
        storage.set("k", "{not json").unwrap();
        assert!(load_json(&storage, "k").is_none());
    }

    #[test]
    fn non_array_snapshot_is_absent() {
        let storage = MemoryLocalStorage::new();
        store_json(&storage, "k", &json!({"id": "x"})).unwrap();
        assert!(load_snapshot(&storage, "k").is_none());
        store_json(&storage, "k", &json!([{"id": "x"}])).unwrap();
        assert_eq!(load_snapshot(&storage, "k").unwrap().len(), 1);
    }
}
