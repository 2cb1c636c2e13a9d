//! Dot-path JSON document manipulation backing the `json.*` instructions.
//! Documents are opaque to the engine; reads return snapshots and writes
//! rewrite the file atomically.

use serde_json::{Map, Value};

/// `a.b.c` lookup; array indices are plain numeric segments.
pub fn get_path(doc: &Value, path: &str) -> Option<Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Set `path`, creating missing intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = current.as_object_mut().expect("object ensured above");
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), value);
            return;
        }
        let next = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        current = next;
    }
}

/// Remove `path`; true when something was removed.
pub fn remove_path(doc: &mut Value, path: &str) -> bool {
    let Some((parents, leaf)) = path.rsplit_once('.') else {
        return doc
            .as_object_mut()
            .and_then(|map| map.remove(path))
            .is_some();
    };
    let mut current = doc;
    for segment in parents.split('.') {
        let Some(next) = current.get_mut(segment) else {
            return false;
        };
        current = next;
    }
    current
        .as_object_mut()
        .and_then(|map| map.remove(leaf))
        .is_some()
}

/// Deep merge: objects merge recursively, everything else replaces.
pub fn merge(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, other) => *slot = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_missing_intermediates() {
        let mut doc = Value::Null;
        set_path(&mut doc, "a.b.c", json!(7));
        assert_eq!(doc, json!({"a": {"b": {"c": 7}}}));
        set_path(&mut doc, "a.b.d", json!("x"));
        assert_eq!(get_path(&doc, "a.b.d"), Some(json!("x")));
    }

    #[test]
    fn get_walks_arrays_by_index() {
        let doc = json!({"models": [{"name": "sd"}, {"name": "flux"}]});
        assert_eq!(get_path(&doc, "models.1.name"), Some(json!("flux")));
        assert_eq!(get_path(&doc, "models.7.name"), None);
    }

    #[test]
    fn remove_reports_presence() {
        let mut doc = json!({"a": {"b": 1}, "c": 2});
        assert!(remove_path(&mut doc, "a.b"));
        assert!(!remove_path(&mut doc, "a.b"));
        assert!(remove_path(&mut doc, "c"));
        assert_eq!(doc, json!({"a": {}}));
    }

    #[test]
    fn merge_is_deep_for_objects_only() {
        let mut doc = json!({"cfg": {"x": 1, "y": 2}, "list": [1, 2]});
        merge(&mut doc, &json!({"cfg": {"y": 3}, "list": [9]}));
        assert_eq!(doc, json!({"cfg": {"x": 1, "y": 3}, "list": [9]}));
    }
}
