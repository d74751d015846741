//! Cycle-safe sanitizer producing plain serializable data.
//!
//! # Responsibility
//! - Turn live object graphs into `serde_json::Value` trees.
//! - Strip functions, framework handles and deny-listed keys.
//!
//! # Invariants
//! - Never panics and never returns an error; offending values are dropped.
//! - Cycle detection is scoped to the current recursion path. A node reached
//!   through two independent paths (a DAG) is expanded once per path and
//!   yields value-equal, independent copies.
//! - Values deeper than `max_depth` are dropped.
//! - `sanitize_plain(sanitize(x)) == sanitize(x)`.

mod live;

pub use live::{
    DocumentRef, FrameworkHandle, LiveArray, LiveObject, LiveValue, PlainDate, RemoteTimestamp,
    StoreHandle,
};

use chrono::{DateTime, SecondsFormat, Utc};
use log::trace;
use serde_json::{Map, Value};

/// Default maximum nesting depth kept by the sanitizer.
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Key prefixes owned by UI frameworks or store internals.
const DENIED_KEY_PREFIXES: &[&str] = &["__", "$$"];

/// Keys known to hold non-serializable handles.
const DENIED_KEYS: &[&str] = &[
    "_firestore",
    "firestore",
    "_delegate",
    "_key",
    "_converter",
    "_document",
    "_query",
    "_owner",
    "_store",
    "stateNode",
    "nativeEvent",
    "currentTarget",
    "target",
    "ownerDocument",
    "parentNode",
    "parentElement",
];

/// Why a value was dropped. Only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    DepthExceeded,
    Cycle,
    Function,
    FrameworkHandle,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::DepthExceeded => "depth_exceeded",
            Self::Cycle => "cycle",
            Self::Function => "function",
            Self::FrameworkHandle => "framework_handle",
        }
    }
}

/// Configurable sanitizer. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    max_depth: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Sanitizer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Sanitizes one live value. `None` means the value is absent.
    pub fn sanitize(&self, value: &LiveValue) -> Option<Value> {
        let mut ancestors = Vec::new();
        self.visit(value, &mut ancestors, 0)
    }

    /// Re-applies the sanitizer rules to already-plain data.
    pub fn sanitize_plain(&self, value: &Value) -> Option<Value> {
        self.sanitize(&LiveValue::from(value))
    }

    /// Sanitizes every element of a record list from its own root, so a list
    /// wrapper never costs its records a level of depth. Dropped elements are
    /// omitted.
    pub fn sanitize_items(&self, items: &[Value]) -> Vec<Value> {
        items
            .iter()
            .filter_map(|item| self.sanitize_plain(item))
            .collect()
    }

    /// Sanitizes a value that must be an object; anything else is absent.
    pub fn sanitize_object(&self, value: &LiveValue) -> Option<Map<String, Value>> {
        match self.sanitize(value)? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// `ancestors` holds the node ids on the current recursion path only.
    fn visit(&self, value: &LiveValue, ancestors: &mut Vec<usize>, depth: usize) -> Option<Value> {
        if depth > self.max_depth {
            return dropped(DropReason::DepthExceeded, depth);
        }

        match value {
            LiveValue::Null => Some(Value::Null),
            LiveValue::Bool(value) => Some(Value::Bool(*value)),
            LiveValue::Number(value) => Some(Value::Number(value.clone())),
            LiveValue::Text(value) => Some(Value::String(value.clone())),
            LiveValue::Timestamp(value) => Some(Value::String(format_timestamp(value))),
            LiveValue::DateLike(date) => Some(match date.to_plain_date() {
                Ok(value) => Value::String(format_timestamp(&value)),
                Err(err) => {
                    trace!("event=sanitize_date module=sanitize status=error error={err}");
                    Value::Null
                }
            }),
            LiveValue::DocumentRef(reference) => {
                let mut map = Map::new();
                map.insert("refPath".to_string(), Value::String(reference.path.clone()));
                Some(Value::Object(map))
            }
            LiveValue::Function(_) => dropped(DropReason::Function, depth),
            LiveValue::Framework(_) => dropped(DropReason::FrameworkHandle, depth),
            LiveValue::Array(array) => {
                let node_id = array.node_id();
                if ancestors.contains(&node_id) {
                    return dropped(DropReason::Cycle, depth);
                }
                ancestors.push(node_id);
                let items = array
                    .items()
                    .iter()
                    .filter_map(|item| self.visit(item, ancestors, depth + 1))
                    .collect();
                ancestors.pop();
                Some(Value::Array(items))
            }
            LiveValue::Object(object) => {
                let node_id = object.node_id();
                if ancestors.contains(&node_id) {
                    return dropped(DropReason::Cycle, depth);
                }
                ancestors.push(node_id);
                let mut map = Map::new();
                for (key, item) in object.entries() {
                    if is_denied_key(&key) {
                        continue;
                    }
                    if let Some(plain) = self.visit(&item, ancestors, depth + 1) {
                        map.insert(key, plain);
                    }
                }
                ancestors.pop();
                Some(Value::Object(map))
            }
        }
    }
}

/// Fixed textual timestamp representation: RFC 3339, UTC, milliseconds.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sanitizes with the default depth limit.
pub fn sanitize(value: &LiveValue) -> Option<Value> {
    Sanitizer::default().sanitize(value)
}

fn is_denied_key(key: &str) -> bool {
    DENIED_KEYS.contains(&key) || DENIED_KEY_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

fn dropped(reason: DropReason, depth: usize) -> Option<Value> {
    trace!(
        "event=sanitize_drop module=sanitize status=skipped reason={} depth={}",
        reason.as_str(),
        depth
    );
    None
}

#[cfg(test)]
mod tests {
    use super::{
        is_denied_key, DocumentRef, FrameworkHandle, LiveArray, LiveObject, LiveValue, PlainDate,
        Sanitizer, StoreHandle,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    struct BrokenDate;

    impl PlainDate for BrokenDate {
        fn to_plain_date(&self) -> Result<DateTime<Utc>, String> {
            Err("corrupt".to_string())
        }
    }

    fn nested(depth: usize) -> LiveValue {
        let mut value = LiveValue::from("leaf");
        for _ in 0..depth {
            value = LiveObject::from_pairs([("child", value)]).into();
        }
        value
    }

    fn leaf_depth(value: &serde_json::Value) -> usize {
        match value.get("child") {
            Some(child) => 1 + leaf_depth(child),
            None => 0,
        }
    }

    #[test]
    fn self_reference_terminates_without_back_edge() {
        let node = LiveObject::from_pairs([("name", LiveValue::from("a"))]);
        node.insert("me", node.clone());
        let plain = Sanitizer::default().sanitize(&node.into()).unwrap();
        assert_eq!(plain, json!({"name": "a"}));
    }

    #[test]
    fn indirect_cycle_is_cut_at_the_repeated_ancestor() {
        let parent = LiveObject::from_pairs([("kind", LiveValue::from("parent"))]);
        let child = LiveObject::from_pairs([("kind", LiveValue::from("child"))]);
        child.insert("parent", parent.clone());
        parent.insert("child", child);
        let plain = Sanitizer::default().sanitize(&parent.into()).unwrap();
        assert_eq!(plain, json!({"kind": "parent", "child": {"kind": "child"}}));
    }

    #[test]
    fn shared_non_cyclic_node_is_copied_under_each_path() {
        let shared = LiveObject::from_pairs([("v", LiveValue::from(1_i64))]);
        let root = LiveObject::from_pairs([
            ("left", LiveValue::from(shared.clone())),
            ("right", LiveValue::from(shared)),
        ]);
        let plain = Sanitizer::default().sanitize(&root.into()).unwrap();
        assert_eq!(plain["left"], json!({"v": 1}));
        assert_eq!(plain["left"], plain["right"]);
    }

    #[test]
    fn depth_limit_keeps_19_and_truncates_25() {
        let sanitizer = Sanitizer::default();
        let kept = sanitizer.sanitize(&nested(19)).unwrap();
        assert_eq!(leaf_depth(&kept), 19);
        assert_eq!(kept.pointer(&"/child".repeat(19)), Some(&json!("leaf")));

        let cut = sanitizer.sanitize(&nested(25)).unwrap();
        assert!(leaf_depth(&cut) < 25);
        assert!(cut.pointer(&"/child".repeat(25)).is_none());
    }

    #[test]
    fn special_values_are_converted_or_dropped() {
        let when = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap();
        let object = LiveObject::from_pairs([
            ("at", LiveValue::from(when)),
            ("broken", LiveValue::date_like(BrokenDate)),
            (
                "client",
                DocumentRef {
                    store: StoreHandle(Arc::from("main")),
                    path: "clients/c1".to_string(),
                }
                .into(),
            ),
            ("onClick", LiveValue::function("onClick")),
            ("el", FrameworkHandle::Element("div".to_string()).into()),
            ("list", LiveArray::from_items([LiveValue::function("f"), 3_i64.into()]).into()),
        ]);
        let plain = Sanitizer::default().sanitize(&object.into()).unwrap();
        assert_eq!(
            plain,
            json!({
                "at": "2026-05-04T03:02:01.000Z",
                "broken": null,
                "client": {"refPath": "clients/c1"},
                "list": [3]
            })
        );
    }

    #[test]
    fn denied_keys_are_stripped() {
        assert!(is_denied_key("__reactFiber$abc"));
        assert!(is_denied_key("$$typeof"));
        assert!(is_denied_key("_firestore"));
        assert!(!is_denied_key("_id"));
        let plain = Sanitizer::default()
            .sanitize_plain(&json!({"name": "x", "__proto": 1, "nativeEvent": {}}))
            .unwrap();
        assert_eq!(plain, json!({"name": "x"}));
    }

    #[test]
    fn sanitize_is_idempotent_on_plain_data() {
        let sanitizer = Sanitizer::default();
        let input = json!({"a": [1, {"b": null, "__x": 2}], "c": "t", "d": 1.5});
        let once = sanitizer.sanitize_plain(&input).unwrap();
        let twice = sanitizer.sanitize_plain(&once).unwrap();
        assert_eq!(once, twice);

        let deep = sanitizer.sanitize(&nested(30)).unwrap();
        assert_eq!(sanitizer.sanitize_plain(&deep).unwrap(), deep);
    }

    #[test]
    fn root_function_is_absent() {
        assert!(Sanitizer::default()
            .sanitize(&LiveValue::function("f"))
            .is_none());
    }
}
