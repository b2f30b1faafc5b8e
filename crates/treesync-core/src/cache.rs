//! In-memory hierarchical data store with change notification.
//!
//! The cache is a rooted tree of maps whose leaves are arbitrary JSON
//! values. Writers address nodes by topic or path; listeners observe changes
//! on two channels: *atomic* (one notification per write, value possibly a
//! subdocument) and *flat* (one notification per changed leaf).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::flatten::{get_at_path, set_at_path, to_flat_object, unset_at_path};
use crate::matcher::{match_paths, Bindings};
use crate::topic::{join_topic, path_to_topic, topic_to_path};

/// Reserved tag key marking updates that originated from broker traffic.
pub const EXTERNAL_TAG: &str = "external";

/// Opaque tag map threaded from a writer to every listener it notifies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags(BTreeMap<String, Value>);

impl Tags {
    /// Empty tag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag set carrying `external: true`.
    #[must_use]
    pub fn external() -> Self {
        let mut tags = Self::default();
        tags.0.insert(EXTERNAL_TAG.to_string(), Value::Bool(true));
        tags
    }

    /// Whether the tagged update originated from the broker.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self.0.get(EXTERNAL_TAG), Some(Value::Bool(true)))
    }

    /// Attach an arbitrary tag.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Read a tag back.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Flattened change set: full topic → new value, `Null` meaning removed.
pub type FlatChanges = BTreeMap<String, Value>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type SubscribeFn = dyn Fn(&FlatChanges, &Tags) + Send + Sync;
type PathFn = dyn Fn(&Value, &str, &Bindings, &Tags) + Send + Sync;

struct PathListener {
    id: u64,
    selector: Vec<String>,
    callback: Arc<PathFn>,
}

struct FlatListener {
    id: u64,
    callback: Arc<SubscribeFn>,
}

struct CacheInner {
    root: Value,
    next_id: u64,
    path_listeners: Vec<PathListener>,
    flat_path_listeners: Vec<PathListener>,
    subscribers: Vec<FlatListener>,
}

/// Shared, observable nested document keyed by topic paths.
///
/// Cloning the handle shares the underlying store. Listener callbacks run
/// after the internal lock is released, atomic channel first, registration
/// order within each channel.
#[derive(Clone)]
pub struct DataCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DataCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                root: Value::Object(Map::new()),
                next_id: 0,
                path_listeners: Vec::new(),
                flat_path_listeners: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("cache lock poisoned")
    }

    /// Write `value` at `topic` with empty tags. See [`update_path_with_tags`].
    ///
    /// [`update_path_with_tags`]: DataCache::update_path_with_tags
    pub fn update(&self, topic: &str, value: Value) -> FlatChanges {
        self.update_path_with_tags(&topic_to_path(topic), value, &Tags::new())
    }

    /// Write `value` at `topic`, threading `tags` through to listeners.
    pub fn update_with_tags(&self, topic: &str, value: Value, tags: &Tags) -> FlatChanges {
        self.update_path_with_tags(&topic_to_path(topic), value, tags)
    }

    /// Write `value` at `path` with empty tags.
    pub fn update_path<S: AsRef<str>>(&self, path: &[S], value: Value) -> FlatChanges {
        self.update_path_with_tags(path, value, &Tags::new())
    }

    /// Write `value` at `path`, replacing the existing subtree.
    ///
    /// `Null` deletes; ancestors that become empty are pruned. Object values
    /// are normalized first (null members stripped, empty maps collapse to
    /// `Null`). A write that leaves the stored value unchanged returns an
    /// empty change set and fires no listeners. The returned map holds every
    /// changed leaf by full topic, removals as `Null`.
    pub fn update_path_with_tags<S: AsRef<str>>(
        &self,
        path: &[S],
        value: Value,
        tags: &Tags,
    ) -> FlatChanges {
        let path: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        let value = normalize(value);
        let base = path_to_topic(&path);

        let (changes, atomic_dispatch, flat_dispatch, subscriber_dispatch) = {
            let mut inner = self.lock();

            let old = get_at_path(&inner.root, &path).cloned();
            if value.is_null() && old.is_none() {
                return FlatChanges::new();
            }
            if old.as_ref() == Some(&value) {
                return FlatChanges::new();
            }

            let mut changes = FlatChanges::new();
            // a leaf on the way down is destroyed by this write
            for depth in 1..path.len() {
                match get_at_path(&inner.root, &path[..depth]) {
                    Some(node) if !node.is_object() => {
                        changes.insert(path_to_topic(&path[..depth]), Value::Null);
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            let old_flat = old.as_ref().map_or_else(BTreeMap::new, |o| flat_at(&base, o));
            let new_flat = flat_at(&base, &value);
            for topic in old_flat.keys() {
                if !new_flat.contains_key(topic) {
                    changes.insert(topic.clone(), Value::Null);
                }
            }
            for (topic, leaf) in &new_flat {
                if old_flat.get(topic) != Some(leaf) {
                    changes.insert(topic.clone(), leaf.clone());
                }
            }

            if value.is_null() {
                unset_at_path(&mut inner.root, &path);
            } else {
                set_at_path(&mut inner.root, &path, value.clone());
            }
            tracing::trace!(topic = %base, changed = changes.len(), "cache update");

            let atomic: Vec<(Arc<PathFn>, Bindings)> = inner
                .path_listeners
                .iter()
                .filter_map(|l| match_paths(&l.selector, &path).map(|b| (l.callback.clone(), b)))
                .collect();
            let flat: Vec<(Arc<PathFn>, String, Value, Bindings)> = inner
                .flat_path_listeners
                .iter()
                .flat_map(|l| {
                    changes.iter().filter_map(move |(topic, leaf)| {
                        match_paths(&l.selector, &topic_to_path(topic))
                            .map(|b| (l.callback.clone(), topic.clone(), leaf.clone(), b))
                    })
                })
                .collect();
            let subscribers: Vec<Arc<SubscribeFn>> = inner
                .subscribers
                .iter()
                .map(|l| l.callback.clone())
                .collect();
            (changes, atomic, flat, subscribers)
        };

        for (callback, bindings) in &atomic_dispatch {
            callback(&value, &base, bindings, tags);
        }
        for (callback, topic, leaf, bindings) in &flat_dispatch {
            callback(leaf, topic, bindings, tags);
        }
        if !changes.is_empty() {
            for callback in &subscriber_dispatch {
                callback(&changes, tags);
            }
        }
        changes
    }

    /// Deep clone of the whole document.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.lock().root.clone()
    }

    /// Deep clone of the subtree at `path`, if any.
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        get_at_path(&self.lock().root, path).cloned()
    }

    /// Deep clone of the subtree at `topic`, if any.
    #[must_use]
    pub fn get_by_topic(&self, topic: &str) -> Option<Value> {
        self.get_path(&topic_to_path(topic))
    }

    /// Register a listener for the full flat change set of every write.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&FlatChanges, &Tags) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(FlatListener {
            id,
            callback: Arc::new(callback),
        });
        ListenerId(id)
    }

    /// Register an atomic-channel listener for writes matching `selector`.
    ///
    /// The callback receives the written value (possibly a subdocument,
    /// `Null` on delete), the concrete topic, the named-wildcard bindings,
    /// and the writer's tags.
    pub fn subscribe_path<F>(&self, selector: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.path_listeners.push(PathListener {
            id,
            selector: topic_to_path(selector),
            callback: Arc::new(callback),
        });
        ListenerId(id)
    }

    /// Register a flat-channel listener: one callback per changed leaf
    /// matching `selector`.
    pub fn subscribe_path_flat<F>(&self, selector: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.flat_path_listeners.push(PathListener {
            id,
            selector: topic_to_path(selector),
            callback: Arc::new(callback),
        });
        ListenerId(id)
    }

    /// Remove a listener registered through any of the subscribe methods.
    pub fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.lock();
        inner.path_listeners.retain(|l| l.id != id.0);
        inner.flat_path_listeners.retain(|l| l.id != id.0);
        inner.subscribers.retain(|l| l.id != id.0);
    }

    /// Filtered deep clone: keeps only branches whose paths can match
    /// `selector` (wildcards honored). Returns `Null` when nothing matches.
    #[must_use]
    pub fn filter_path<S: AsRef<str>>(&self, selector: &[S]) -> Value {
        filter_node(&self.lock().root, selector)
    }

    /// Filtered deep clone addressed by selector topic.
    #[must_use]
    pub fn filter_by_topic(&self, selector: &str) -> Value {
        self.filter_path(&topic_to_path(selector))
    }

    /// Invoke `callback` for every concrete node currently matching the
    /// selector path, with its value, concrete path, and bindings.
    pub fn for_match_path<S, F>(&self, selector: &[S], mut callback: F)
    where
        S: AsRef<str>,
        F: FnMut(&Value, &[String], &Bindings),
    {
        let matches = {
            let inner = self.lock();
            let mut out = Vec::new();
            let mut path = Vec::new();
            let mut bindings = Bindings::new();
            collect_matches(&inner.root, selector, &mut path, &mut bindings, &mut out);
            out
        };
        for (value, path, bindings) in &matches {
            callback(value, path, bindings);
        }
    }

    /// Selector-topic form of [`for_match_path`].
    ///
    /// [`for_match_path`]: DataCache::for_match_path
    pub fn for_match<F>(&self, selector: &str, callback: F)
    where
        F: FnMut(&Value, &[String], &Bindings),
    {
        self.for_match_path(&topic_to_path(selector), callback);
    }
}

/// Flat view of `value` rooted at `base`: scalar → single entry at `base`,
/// map → one entry per leaf, `Null` → empty.
fn flat_at(base: &str, value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Null => BTreeMap::new(),
        Value::Object(_) => to_flat_object(value)
            .into_iter()
            .map(|(key, leaf)| (join_topic(base, &key), leaf))
            .collect(),
        leaf => std::iter::once((base.to_string(), leaf.clone())).collect(),
    }
}

/// Strip null members and collapse empty maps; `null` is equivalent to
/// unset at every level. Arrays are opaque and left untouched.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, child)| {
                    let child = normalize(child);
                    (!child.is_null()).then_some((key, child))
                })
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        other => other,
    }
}

fn filter_node<S: AsRef<str>>(node: &Value, selector: &[S]) -> Value {
    let Some((head, rest)) = selector.split_first() else {
        return node.clone();
    };
    let head = head.as_ref();
    if head == "#" {
        return node.clone();
    }
    let Value::Object(map) = node else {
        return Value::Null;
    };
    let mut out = Map::new();
    for (key, child) in map {
        let matches =
            head == "+" || head == "*" || (head.len() >= 2 && head.starts_with('+')) || head == key;
        if matches {
            let sub = filter_node(child, rest);
            if !sub.is_null() {
                out.insert(key.clone(), sub);
            }
        }
    }
    if out.is_empty() {
        Value::Null
    } else {
        Value::Object(out)
    }
}

fn collect_matches<S: AsRef<str>>(
    node: &Value,
    selector: &[S],
    path: &mut Vec<String>,
    bindings: &mut Bindings,
    out: &mut Vec<(Value, Vec<String>, Bindings)>,
) {
    let Some((head, rest)) = selector.split_first() else {
        out.push((node.clone(), path.clone(), bindings.clone()));
        return;
    };
    let head = head.as_ref();
    if head == "#" {
        out.push((node.clone(), path.clone(), bindings.clone()));
        return;
    }
    let Value::Object(map) = node else { return };
    for (key, child) in map {
        if head == "+" || head == "*" {
            path.push(key.clone());
            collect_matches(child, rest, path, bindings, out);
            path.pop();
        } else if head.len() >= 2 && head.starts_with('+') {
            bindings.insert(head[1..].to_string(), key.clone());
            path.push(key.clone());
            collect_matches(child, rest, path, bindings, out);
            path.pop();
            bindings.remove(&head[1..]);
        } else if head == key {
            path.push(key.clone());
            collect_matches(child, rest, path, bindings, out);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn update_then_get() {
        let cache = DataCache::new();
        cache.update("/a/b", json!(1));
        assert_eq!(cache.get_path(&["a", "b"]), Some(json!(1)));
        assert_eq!(cache.get_by_topic("/a"), Some(json!({"b": 1})));
    }

    #[test]
    fn null_unsets_and_prunes_ancestors() {
        let cache = DataCache::new();
        cache.update("/a/b/c", json!(1));
        cache.update("/a/b/c", Value::Null);
        assert_eq!(cache.get_by_topic("/a/b/c"), None);
        assert_eq!(cache.get_by_topic("/a/b"), None);
        assert_eq!(cache.get_by_topic("/a"), None);
        assert_eq!(cache.snapshot(), json!({}));
    }

    #[test]
    fn equal_write_is_suppressed() {
        let cache = DataCache::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cache.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.update("/a", json!({"b": 1}));
        cache.update("/a", json!({"b": 1}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deleting_nothing_is_a_noop() {
        let cache = DataCache::new();
        let changes = cache.update("/a/b", Value::Null);
        assert!(changes.is_empty());
    }

    #[test]
    fn changes_report_only_differences() {
        let cache = DataCache::new();
        cache.update("/a", json!({"b": 1, "c": 2}));
        let changes = cache.update("/a", json!({"b": 1, "d": 3}));
        assert_eq!(changes.get("/a/c"), Some(&Value::Null));
        assert_eq!(changes.get("/a/d"), Some(&json!(3)));
        assert_eq!(changes.get("/a/b"), None);
    }

    #[test]
    fn clobbered_leaf_is_reported_removed() {
        let cache = DataCache::new();
        cache.update("/a", json!(5));
        let changes = cache.update("/a/b", json!(1));
        assert_eq!(changes.get("/a"), Some(&Value::Null));
        assert_eq!(changes.get("/a/b"), Some(&json!(1)));
        assert_eq!(cache.get_by_topic("/a"), Some(json!({"b": 1})));
    }

    #[test]
    fn atomic_listeners_fire_before_flat() {
        let cache = DataCache::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();
        cache.subscribe_path("/a/#", move |_, _, _, _| {
            log.lock().unwrap().push("atomic");
        });
        let log = order.clone();
        cache.subscribe_path_flat("/a/#", move |_, _, _, _| {
            log.lock().unwrap().push("flat");
        });
        let log = order.clone();
        cache.subscribe(move |_, _| {
            log.lock().unwrap().push("global");
        });
        cache.update("/a/b", json!(1));
        assert_eq!(*order.lock().unwrap(), vec!["atomic", "flat", "global"]);
    }

    #[test]
    fn wildcard_bindings_reach_listeners() {
        let cache = DataCache::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        cache.subscribe_path("/+org/+dev/status", move |value, topic, bindings, _| {
            *slot.lock().unwrap() = Some((value.clone(), topic.to_string(), bindings.clone()));
        });
        cache.update("/acme/r1/status", json!("ok"));
        let (value, topic, bindings) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(topic, "/acme/r1/status");
        assert_eq!(bindings.get("org").map(String::as_str), Some("acme"));
        assert_eq!(bindings.get("dev").map(String::as_str), Some("r1"));
    }

    #[test]
    fn flat_listener_sees_each_leaf() {
        let cache = DataCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        cache.subscribe_path_flat("/a/#", move |value, topic, _, _| {
            log.lock().unwrap().push((topic.to_string(), value.clone()));
        });
        cache.update("/a", json!({"b": 1, "c": {"d": 2}}));
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("/a/b".to_string(), json!(1)),
                ("/a/c/d".to_string(), json!(2)),
            ]
        );
    }

    #[test]
    fn external_tag_reaches_listeners() {
        let cache = DataCache::new();
        let external = Arc::new(AtomicUsize::new(0));
        let flag = external.clone();
        cache.subscribe_path("/#", move |_, _, _, tags| {
            if tags.is_external() {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });
        cache.update_with_tags("/a", json!(1), &Tags::external());
        cache.update("/b", json!(2));
        assert_eq!(external.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_members_are_stripped_on_write() {
        let cache = DataCache::new();
        cache.update("/a", json!({"b": 1, "c": null, "d": {}}));
        assert_eq!(cache.get_by_topic("/a"), Some(json!({"b": 1})));
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let cache = DataCache::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = cache.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.update("/a", json!(1));
        cache.unsubscribe(id);
        cache.update("/a", json!(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filter_keeps_matching_branches() {
        let cache = DataCache::new();
        cache.update("/acme/r1/status", json!("ok"));
        cache.update("/acme/r2/status", json!("down"));
        cache.update("/acme/r1/config", json!({"rate": 5}));
        let filtered = cache.filter_by_topic("/acme/+/status");
        assert_eq!(
            filtered,
            json!({"acme": {"r1": {"status": "ok"}, "r2": {"status": "down"}}})
        );
    }

    #[test]
    fn for_match_iterates_current_matches() {
        let cache = DataCache::new();
        cache.update("/acme/r1/status", json!("ok"));
        cache.update("/acme/r2/status", json!("down"));
        let mut seen = Vec::new();
        cache.for_match("/acme/+dev/status", |value, path, bindings| {
            seen.push((
                value.clone(),
                path.to_vec(),
                bindings.get("dev").cloned().unwrap_or_default(),
            ));
        });
        seen.sort_by(|a, b| a.2.cmp(&b.2));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, json!("ok"));
        assert_eq!(seen[0].1, vec!["acme", "r1", "status"]);
        assert_eq!(seen[0].2, "r1");
    }

    #[test]
    fn tags_custom_entries_roundtrip() {
        let mut tags = Tags::new();
        tags.insert("source", json!("unit-test"));
        assert_eq!(tags.get("source"), Some(&json!("unit-test")));
        assert!(!tags.is_external());
        assert!(Tags::external().is_external());
    }
}
