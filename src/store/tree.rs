//! JSON Tree Operations
//!
//! The store holds one `serde_json::Value` tree. `null` means absent: setting a
//! node to `null` removes it, and parents left empty are pruned.

use serde_json::{json, Map, Value};

/// Key of the server-value sentinel object.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Server-value sentinel that resolves to the write's server timestamp.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Whether `value` is the timestamp sentinel.
pub fn is_timestamp_sentinel(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
        }
        _ => false,
    }
}

/// Replace every timestamp sentinel inside `value` with `timestamp`.
pub fn resolve_server_values(value: &mut Value, timestamp: i64) {
    if is_timestamp_sentinel(value) {
        *value = Value::from(timestamp);
        return;
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                resolve_server_values(child, timestamp);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                resolve_server_values(child, timestamp);
            }
        }
        _ => {}
    }
}

/// Node at `path`, treating `null` as absent.
pub fn get<'a>(node: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = node;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Set the node at `path`. A `null` value removes it.
pub fn set(node: &mut Value, path: &[String], mut value: Value) {
    strip_nulls(&mut value);
    if value.is_null() || is_empty_object(&value) {
        remove(node, path);
        return;
    }
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        set(child, rest, value);
    }
}

/// Remove the node at `path`, pruning parents left empty.
///
/// Returns whether `node` itself is now empty.
pub fn remove(node: &mut Value, path: &[String]) -> bool {
    let Some((head, rest)) = path.split_first() else {
        *node = Value::Null;
        return true;
    };
    match node {
        Value::Object(map) => {
            let prune = match map.get_mut(head) {
                Some(child) => remove(child, rest),
                None => false,
            };
            if prune {
                map.remove(head);
            }
            map.is_empty()
        }
        Value::Null => true,
        _ => false,
    }
}

/// Drop `null` and empty-object children so stored values never hold them.
fn strip_nulls(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, child| {
            strip_nulls(child);
            !child.is_null() && !is_empty_object(child)
        });
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> Vec<String> {
        raw.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
    }

    #[test]
    fn test_set_and_get_nested() {
        let mut root = Value::Null;
        set(&mut root, &p("online_players/p1/position"), json!({"x": 1, "y": 2}));
        assert_eq!(get(&root, &p("online_players/p1/position/x")), Some(&json!(1)));
        assert_eq!(get(&root, &p("online_players/p2")), None);
    }

    #[test]
    fn test_null_removes_and_prunes() {
        let mut root = Value::Null;
        set(&mut root, &p("online_players/p1/chatMessage"), json!("hola"));
        set(&mut root, &p("users/p1/username"), json!("ana"));

        set(&mut root, &p("online_players/p1/chatMessage"), Value::Null);
        assert_eq!(get(&root, &p("online_players")), None);
        assert_eq!(get(&root, &p("users/p1/username")), Some(&json!("ana")));
    }

    #[test]
    fn test_written_nulls_are_not_stored() {
        let mut root = Value::Null;
        set(&mut root, &p("online_players/p1"), json!({"chatMessage": null, "isMoving": false}));
        assert_eq!(get(&root, &p("online_players/p1")), Some(&json!({"isMoving": false})));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut root = json!({"a": {"b": 1}});
        remove(&mut root, &p("a/c"));
        assert_eq!(root, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_resolve_nested_sentinels() {
        let mut value = json!({
            "lastUpdated": server_timestamp(),
            "nested": {"at": server_timestamp(), "keep": {".sv": "other"}},
        });
        resolve_server_values(&mut value, 1234);
        assert_eq!(value["lastUpdated"], json!(1234));
        assert_eq!(value["nested"]["at"], json!(1234));
        assert_eq!(value["nested"]["keep"], json!({".sv": "other"}));
    }
}
