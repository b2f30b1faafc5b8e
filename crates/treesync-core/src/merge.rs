//! Deep merge of JSON documents, last writer wins per leaf.

use serde_json::Value;

/// Merge `incoming` into `target`.
///
/// Maps merge per key, recursively; any other pairing overwrites the target
/// wholesale. Arrays are opaque leaves and are replaced, not concatenated.
pub fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        a.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disjoint_keys_union() {
        let mut a = json!({"a": 1});
        deep_merge(&mut a, &json!({"b": 2}));
        assert_eq!(a, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn last_writer_wins_per_leaf() {
        let mut a = json!({"x": {"a": 1, "b": 2}});
        deep_merge(&mut a, &json!({"x": {"b": 3, "c": 4}}));
        assert_eq!(a, json!({"x": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn leaf_replaces_subtree() {
        let mut a = json!({"x": {"a": 1}});
        deep_merge(&mut a, &json!({"x": 5}));
        assert_eq!(a, json!({"x": 5}));
    }

    #[test]
    fn arrays_replace() {
        let mut a = json!({"x": [1, 2]});
        deep_merge(&mut a, &json!({"x": [3]}));
        assert_eq!(a, json!({"x": [3]}));
    }
}
