//! Nested document ⇄ flat topic mapping, plus in-place tree edits.
//!
//! A document is a `serde_json::Value` whose interior nodes are maps; arrays
//! and every other value are opaque leaves.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::topic::{encode_topic_element, topic_to_path};

/// Flatten a nested document into a map from relative encoded topic to leaf.
///
/// Keys are `/`-joined percent-encoded paths. Arrays and non-map values
/// terminate descent. Not idempotent: a key that already contains `/` is
/// encoded again when the result is re-flattened.
#[must_use]
pub fn to_flat_object(doc: &Value) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    flatten_into(doc, String::new(), &mut flat);
    flat
}

fn flatten_into(node: &Value, prefix: String, flat: &mut BTreeMap<String, Value>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                let encoded = encode_topic_element(key);
                let child_prefix = if prefix.is_empty() {
                    encoded
                } else {
                    format!("{prefix}/{encoded}")
                };
                flatten_into(child, child_prefix, flat);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                flat.insert(prefix, leaf.clone());
            }
        }
    }
}

/// Look up the node at `path`, if present.
#[must_use]
pub fn get_at_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment.as_ref())?;
    }
    Some(node)
}

/// Replace the subtree at `path` with `value`, creating interior maps as
/// needed. An intermediate leaf on the way down is converted to a map and
/// its old value is lost.
pub fn set_at_path<S: AsRef<str>>(root: &mut Value, path: &[S], value: Value) {
    match path.split_first() {
        None => *root = value,
        Some((head, rest)) => {
            if !root.is_object() {
                *root = Value::Object(Map::new());
            }
            if let Value::Object(map) = root {
                let child = map
                    .entry(head.as_ref().to_string())
                    .or_insert(Value::Null);
                set_at_path(child, rest, value);
            }
        }
    }
}

/// Remove the subtree at `path`, pruning ancestors that become empty.
pub fn unset_at_path<S: AsRef<str>>(root: &mut Value, path: &[S]) {
    let Some((head, rest)) = path.split_first() else {
        // clearing the root empties the document
        *root = Value::Object(Map::new());
        return;
    };
    if let Value::Object(map) = root {
        if rest.is_empty() {
            map.remove(head.as_ref());
        } else if let Some(child) = map.get_mut(head.as_ref()) {
            unset_at_path(child, rest);
            if child.as_object().is_some_and(Map::is_empty) {
                map.remove(head.as_ref());
            }
        }
    }
}

/// Apply a modifier (topic → value) to a document, in entry order.
///
/// `Null` values unset their topic and prune now-empty ancestors.
pub fn update_object(doc: &mut Value, modifier: &[(String, Value)]) {
    for (topic, value) in modifier {
        let path = topic_to_path(topic);
        if value.is_null() {
            unset_at_path(doc, &path);
        } else {
            set_at_path(doc, &path, value.clone());
        }
    }
}
