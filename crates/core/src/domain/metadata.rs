//! Additive JSON merge used for payment audit trails.

use serde_json::{Map, Value};

/// Deep-merges `patch` into `target`.
///
/// Objects merge key by key, arrays are appended, and scalars in `patch` replace scalars
/// in `target`. A non-object `target` is wrapped under `"legacy"` so nothing already
/// recorded is lost.
pub fn merge(target: &mut Value, patch: Value) {
    if !target.is_object() {
        let previous = std::mem::take(target);
        let mut wrapped = Map::new();
        if !previous.is_null() {
            wrapped.insert("legacy".to_string(), previous);
        }
        *target = Value::Object(wrapped);
    }

    let Value::Object(patch) = patch else {
        append(target, "legacy", patch);
        return;
    };

    if let Value::Object(existing) = target {
        for (key, incoming) in patch {
            match existing.get_mut(&key) {
                Some(current) => merge_value(current, incoming),
                None => {
                    existing.insert(key, incoming);
                }
            }
        }
    }
}

/// Pushes `entry` onto the array stored at `key`, creating it when absent.
pub fn append(target: &mut Value, key: &str, entry: Value) {
    if !target.is_object() {
        merge(target, Value::Object(Map::new()));
    }

    if let Value::Object(existing) = target {
        match existing.get_mut(key) {
            Some(Value::Array(items)) => items.push(entry),
            Some(other) => {
                let previous = std::mem::take(other);
                *other = Value::Array(vec![previous, entry]);
            }
            None => {
                existing.insert(key.to_string(), Value::Array(vec![entry]));
            }
        }
    }
}

fn merge_value(current: &mut Value, incoming: Value) {
    match incoming {
        Value::Object(_) if current.is_object() => merge(current, incoming),
        Value::Array(more) => match current {
            Value::Array(items) => items.extend(more),
            other => *other = Value::Array(more),
        },
        other => *current = other,
    }
}
