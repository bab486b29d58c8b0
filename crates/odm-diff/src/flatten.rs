//! Flattening between nested mappings and dotted-path leaf mappings.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A flattened document: dotted leaf path (e.g. `"a.b.c"`) to leaf value.
pub type FlatDoc = BTreeMap<String, Value>;

/// Flatten a nested mapping into dotted-path leaves.
///
/// Only nested mappings are descended into; lists and scalars are terminal
/// leaf values. Flattening is deterministic and total for any mapping.
pub fn flatten(fields: &Map<String, Value>) -> FlatDoc {
    let mut out = FlatDoc::new();
    flatten_into("", fields, &mut out);
    out
}

fn flatten_into(prefix: &str, fields: &Map<String, Value>, out: &mut FlatDoc) {
    for (key, value) in fields {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_into(&path, inner, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// Rebuild a nested mapping from dotted-path leaves.
///
/// Inverse of [`flatten`] for any mapping that round-trips (empty mappings
/// have no leaves and are not reconstructed). If a leaf path passes through
/// a scalar, the scalar is replaced by a mapping.
pub fn unflatten(flat: &FlatDoc) -> Map<String, Value> {
    let mut root = Map::new();
    for (path, value) in flat {
        insert_path(&mut root, path, value.clone());
    }
    root
}

fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = root;
    for segment in parents {
        let entry = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        cursor = next;
    }
    cursor.insert(last.to_string(), value);
}
