//! The sync engine: keeps a region of broker retained state equal to a
//! region of the local store.
//!
//! Inbound messages are classified as heartbeat, RPC, or sync traffic. Sync
//! messages land in the local [`DataCache`] tagged `external`; local writes
//! without that tag flow back out through the publication queue as retained
//! messages, reconciling transitions between atomic subdocuments and
//! per-leaf values so the broker never holds both shapes at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use treesync_core::{
    encode_topic_element, join_topic, match_topics, path_to_topic, to_flat_object, topic_to_path,
    DataCache, FlatChanges, Tags,
};
use treesync_proto::{decode_payload, normalize_selector, PayloadError, HEARTBEAT_TOPIC, SENTINEL};

use crate::migrate::Migration;
use crate::mqtt::{Grant, MqttClient, MqttError, PublishOptions, SubscribeOptions};
use crate::queue::PublicationQueue;

/// Errors surfaced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The broker denied a subscription (granted QoS ≥ 0x80).
    #[error("subscription denied for {topic} (granted qos {qos})")]
    SubscribeDenied {
        /// The refused topic filter.
        topic: String,
        /// The SUBACK reason code.
        qos: u8,
    },
    /// Transport-level failure from the broker client.
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// The responder vanished before answering an RPC call.
    #[error("response channel closed")]
    ResponseDropped,
    /// A migration item does not follow the capability topic schema.
    #[error("invalid migration item: {0}")]
    InvalidMigration(String),
}

/// Hook invoked with the flat change set after a subscribed inbound update.
pub type ChangeHook = Arc<dyn Fn(&FlatChanges) + Send + Sync>;
/// Hook invoked exactly once when the engine is ready.
pub type ReadyHook = Box<dyn FnOnce() + Send>;
/// Hook invoked when the broker grants the heartbeat subscription.
pub type HeartbeatGrantedHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) type RpcHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;
type MessageListener = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Configuration for [`MqttSync`].
#[derive(Default)]
pub struct MqttSyncOptions {
    /// Process every inbound message as if it carried the retain flag.
    /// Required on MQTT 3.1.1 stacks, which cannot forward retain-as-published.
    pub ignore_retain: bool,
    /// Drop this many leading segments from every inbound topic before
    /// processing (namespace-slicing consumers).
    pub slice_topic: usize,
    /// Version-namespace migrations to run before the engine reports ready.
    pub migrations: Vec<Migration>,
    /// Called with the change set after a subscribed inbound update applied.
    pub on_change: Option<ChangeHook>,
    /// Called exactly once when the engine is ready: one heartbeat after the
    /// second tick, or one heartbeat after migrations complete.
    pub on_ready: Option<ReadyHook>,
    /// Called when the broker grants the heartbeat subscription.
    pub on_heartbeat_granted: Option<HeartbeatGrantedHook>,
}

/// Options for a published selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishedOptions {
    /// Publish the whole subdocument as one retained payload at the region
    /// root instead of one retained message per leaf.
    pub atomic: bool,
}

pub(crate) struct PublishedEntry {
    pub(crate) selector: String,
    pub(crate) atomic: bool,
    pub(crate) mqtt_subscribed: bool,
}

pub(crate) struct SyncState {
    pub(crate) published: Vec<PublishedEntry>,
    pub(crate) subscribed: Vec<String>,
    pub(crate) received_topics: BTreeSet<String>,
    pub(crate) heartbeats_seen: u64,
    active_waiters: Vec<oneshot::Sender<()>>,
    pending_waiters: Vec<oneshot::Sender<()>>,
    message_listeners: Vec<(u64, MessageListener)>,
    next_listener_id: u64,
    pub(crate) rpc_handlers: HashMap<String, RpcHandlerFn>,
    pub(crate) rpc_callbacks: HashMap<String, oneshot::Sender<Value>>,
    disconnect_hooks: Vec<DisconnectHook>,
    ready_scheduled: bool,
    on_ready: Option<ReadyHook>,
    on_change: Option<ChangeHook>,
    on_heartbeat_granted: Option<HeartbeatGrantedHook>,
}

/// State-synchronization engine over an externally managed MQTT client.
pub struct MqttSync {
    pub(crate) client: Arc<dyn MqttClient>,
    /// The local hierarchical store this engine mirrors to the broker.
    pub data: DataCache,
    pub(crate) published_messages: DataCache,
    pub(crate) queue: PublicationQueue,
    ignore_retain: bool,
    slice_topic: usize,
    migrations_configured: bool,
    migrations: Mutex<Vec<Migration>>,
    state: Mutex<SyncState>,
}

impl MqttSync {
    /// Create an engine bound to `client`.
    ///
    /// Call [`start`](MqttSync::start) once a Tokio runtime is available,
    /// and feed every inbound message to
    /// [`handle_message`](MqttSync::handle_message).
    #[must_use]
    pub fn new(client: Arc<dyn MqttClient>, options: MqttSyncOptions) -> Arc<Self> {
        Arc::new(Self {
            queue: PublicationQueue::new(client.clone()),
            client,
            data: DataCache::new(),
            published_messages: DataCache::new(),
            ignore_retain: options.ignore_retain,
            slice_topic: options.slice_topic,
            migrations_configured: !options.migrations.is_empty(),
            migrations: Mutex::new(options.migrations),
            state: Mutex::new(SyncState {
                published: Vec::new(),
                subscribed: Vec::new(),
                received_topics: BTreeSet::new(),
                heartbeats_seen: 0,
                active_waiters: Vec::new(),
                pending_waiters: Vec::new(),
                message_listeners: Vec::new(),
                next_listener_id: 0,
                rpc_handlers: HashMap::new(),
                rpc_callbacks: HashMap::new(),
                disconnect_hooks: Vec::new(),
                ready_scheduled: false,
                on_ready: options.on_ready,
                on_change: options.on_change,
                on_heartbeat_granted: options.on_heartbeat_granted,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("sync state lock poisoned")
    }

    /// Subscribe the broker heartbeat and launch configured migrations.
    ///
    /// # Errors
    ///
    /// Returns an error when the heartbeat subscription fails or is denied.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let grants = self
            .client
            .subscribe(HEARTBEAT_TOPIC, SubscribeOptions::default())
            .await?;
        check_grants(HEARTBEAT_TOPIC, &grants)?;
        let granted = self.lock().on_heartbeat_granted.take();
        if let Some(hook) = granted {
            hook();
        }
        let migrations = std::mem::take(
            &mut *self.migrations.lock().expect("migrations lock poisoned"),
        );
        if !migrations.is_empty() {
            let sync = self.clone();
            tokio::spawn(async move { sync.run_migrations(migrations).await });
        }
        Ok(())
    }

    /// Feed one inbound broker message into the engine.
    ///
    /// Adapters call this for every delivered message; the ordering
    /// guarantees assume a single caller.
    pub fn handle_message(self: &Arc<Self>, topic: &str, payload: &[u8], retained: bool) {
        if topic == HEARTBEAT_TOPIC {
            self.handle_heartbeat();
            return;
        }

        let listeners: Vec<MessageListener> = {
            let mut state = self.lock();
            state.received_topics.insert(topic.to_string());
            state
                .message_listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };
        for listener in listeners {
            listener(topic, payload);
        }

        let mut path = topic_to_path(topic);
        if self.slice_topic > 0 {
            if path.len() < self.slice_topic {
                return;
            }
            path.drain(..self.slice_topic);
        }
        let logical = path_to_topic(&path);

        let handler = self.lock().rpc_handlers.get(&logical).cloned();
        if let Some(handler) = handler {
            self.dispatch_rpc_request(&logical, payload, handler);
            return;
        }
        let callback = self.lock().rpc_callbacks.remove(&logical);
        if let Some(sender) = callback {
            self.dispatch_rpc_response(&logical, payload, sender);
            return;
        }

        if !(retained || self.ignore_retain) {
            // transient binary traffic outside our protocols
            return;
        }

        // our own flat-published region round-trips back through the broker;
        // keep the mirror accurate and apply it with the external tag
        let flat_published = {
            let state = self.lock();
            state
                .published
                .iter()
                .any(|entry| !entry.atomic && match_topics(&entry.selector, &logical).is_some())
        };
        if flat_published {
            match decode_payload(payload) {
                Ok(value) => {
                    self.published_messages.update_path(
                        &sentinel_path(&path),
                        value.clone(),
                    );
                    self.data
                        .update_path_with_tags(&path, value, &Tags::external());
                }
                Err(PayloadError::NotUtf8) => {
                    tracing::warn!(topic = %logical, "ignoring non-UTF-8 payload on published region");
                }
                Err(PayloadError::Json(err)) => {
                    tracing::warn!(topic = %logical, error = %err, "malformed JSON on published region; treating as clear");
                    self.published_messages
                        .update_path(&sentinel_path(&path), Value::Null);
                    self.data
                        .update_path_with_tags(&path, Value::Null, &Tags::external());
                }
            }
            return;
        }

        let is_subscribed = {
            let state = self.lock();
            state
                .subscribed
                .iter()
                .any(|selector| match_topics(selector, &logical).is_some())
        };
        if is_subscribed {
            let value = match decode_payload(payload) {
                Ok(value) => value,
                Err(PayloadError::NotUtf8) => {
                    tracing::debug!(topic = %logical, "ignoring non-UTF-8 payload");
                    return;
                }
                Err(PayloadError::Json(err)) => {
                    tracing::warn!(topic = %logical, error = %err, "malformed JSON payload; treating as deletion");
                    Value::Null
                }
            };
            let changes = self
                .data
                .update_path_with_tags(&path, value, &Tags::external());
            if !changes.is_empty() {
                let hook = self.lock().on_change.clone();
                if let Some(hook) = hook {
                    hook(&changes);
                }
            }
        }
    }

    fn handle_heartbeat(self: &Arc<Self>) {
        let (waiters, schedule_ready) = {
            let mut state = self.lock();
            state.heartbeats_seen += 1;
            // promote waiters registered before this tick; anything
            // registered while we fire lands on the next tick
            let pending = std::mem::take(&mut state.pending_waiters);
            state.active_waiters.extend(pending);
            let waiters = if state.heartbeats_seen == 1 {
                // the initial retained heartbeat reflects past broker state
                Vec::new()
            } else {
                std::mem::take(&mut state.active_waiters)
            };
            let schedule_ready = state.heartbeats_seen == 2
                && !state.ready_scheduled
                && !self.migrations_configured;
            if schedule_ready {
                state.ready_scheduled = true;
            }
            (waiters, schedule_ready)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        if schedule_ready {
            let sync = self.clone();
            tokio::spawn(async move {
                sync.wait_for_heartbeat_once().await;
                sync.fire_ready();
            });
        }
    }

    pub(crate) fn fire_ready(self: &Arc<Self>) {
        let hook = self.lock().on_ready.take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Future resolving on the next heartbeat tick.
    ///
    /// Registration defers by one tick boundary: waiting again from within a
    /// heartbeat-driven task resolves on the following tick, never the
    /// current one. The broker's initial retained heartbeat never resolves
    /// waiters.
    pub fn wait_for_heartbeat_once(&self) -> impl std::future::Future<Output = ()> + Send {
        let (tx, rx) = oneshot::channel();
        self.lock().pending_waiters.push(tx);
        async move {
            let _ = rx.await;
        }
    }

    /// Number of heartbeat ticks observed so far.
    #[must_use]
    pub fn heartbeats_seen(&self) -> u64 {
        self.lock().heartbeats_seen
    }

    /// Mirror the region under `selector` from the local store to the broker.
    ///
    /// Returns `false` when the selector is already published with identical
    /// options. Re-publishing with the other mode re-registers in place;
    /// subsequent writes reconcile the broker's old shape (clears first,
    /// then rewrites) before the new value lands.
    ///
    /// # Errors
    ///
    /// Returns an error when the flat-mode mirror subscription fails.
    pub async fn publish(
        self: &Arc<Self>,
        selector: &str,
        options: PublishedOptions,
    ) -> Result<bool, SyncError> {
        let selector = normalize_selector(selector);
        let (install_hook, need_subscribe) = {
            let mut state = self.lock();
            match state
                .published
                .iter_mut()
                .find(|entry| entry.selector == selector)
            {
                Some(entry) => {
                    if entry.atomic == options.atomic {
                        return Ok(false);
                    }
                    entry.atomic = options.atomic;
                    let need = !options.atomic && !entry.mqtt_subscribed;
                    if need {
                        entry.mqtt_subscribed = true;
                    }
                    (false, need)
                }
                None => {
                    state.published.push(PublishedEntry {
                        selector: selector.clone(),
                        atomic: options.atomic,
                        mqtt_subscribed: !options.atomic,
                    });
                    (true, !options.atomic)
                }
            }
        };
        if install_hook {
            let weak = Arc::downgrade(self);
            let sel = selector.clone();
            self.data
                .subscribe_path(&selector, move |value, topic, _bindings, tags| {
                    if tags.is_external() {
                        return;
                    }
                    if let Some(sync) = weak.upgrade() {
                        sync.reconcile_published(&sel, topic, value);
                    }
                });
        }
        if need_subscribe {
            let grants = self
                .client
                .subscribe(&selector, SubscribeOptions::default())
                .await?;
            check_grants(&selector, &grants)?;
        }
        Ok(true)
    }

    /// React to a local write inside a published region: reconcile the
    /// broker's previous shape, then enqueue the new value(s).
    fn reconcile_published(self: &Arc<Self>, selector: &str, topic: &str, value: &Value) {
        let selector_path = topic_to_path(selector);
        let depth = selector_path.len().saturating_sub(1); // trailing '#'
        let path = topic_to_path(topic);
        if path.len() < depth {
            return;
        }
        let grounded = path_to_topic(&path[..depth]);
        let atomic = {
            let state = self.lock();
            match state
                .published
                .iter()
                .find(|entry| entry.selector == selector)
            {
                Some(entry) => entry.atomic,
                None => return,
            }
        };
        if atomic {
            // clear finer-grained retained messages the mirror still tracks
            for (stale, _) in self.sentinel_topics_under(&grounded) {
                if stale != grounded {
                    self.enqueue(&stale, Value::Null);
                }
            }
            let current = self.data.get_by_topic(&grounded).unwrap_or(Value::Null);
            self.enqueue(&grounded, current);
        } else {
            // a coarser atomic payload above the change must be reified into
            // per-leaf messages before finer topics are touched
            for len in depth..path.len() {
                let ancestor = path_to_topic(&path[..len]);
                let mut ancestor_sentinel = path[..len].to_vec();
                ancestor_sentinel.push(SENTINEL.to_string());
                if let Some(old @ Value::Object(_)) =
                    self.published_messages.get_path(&ancestor_sentinel)
                {
                    self.enqueue(&ancestor, Value::Null);
                    for (key, leaf) in to_flat_object(&old) {
                        self.enqueue(&join_topic(&ancestor, &key), leaf);
                    }
                }
            }
            // diff the changed subtree against what the broker holds
            let old_topics: Vec<String> = self
                .sentinel_topics_under(topic)
                .into_iter()
                .map(|(t, _)| t)
                .collect();
            let new_flat: Vec<(String, Value)> = match value {
                Value::Null => Vec::new(),
                Value::Object(_) => to_flat_object(value)
                    .into_iter()
                    .map(|(key, leaf)| (join_topic(topic, &key), leaf))
                    .collect(),
                leaf => vec![(topic.to_string(), leaf.clone())],
            };
            for stale in &old_topics {
                if !new_flat.iter().any(|(t, _)| t == stale) {
                    self.enqueue(stale, Value::Null);
                }
            }
            for (t, v) in new_flat {
                self.enqueue(&t, v);
            }
        }
    }

    /// Broker topics the mirror believes are retained at or under `topic`.
    fn sentinel_topics_under(&self, topic: &str) -> Vec<(String, Value)> {
        let Some(subtree) = self.published_messages.get_by_topic(topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        collect_sentinels(&subtree, topic, &mut out);
        out
    }

    /// Queue a retained publish and optimistically mirror the intent, so
    /// same-tick reconciliation sees what will reach the broker.
    pub(crate) fn enqueue(&self, topic: &str, value: Value) {
        let mut mirror = topic_to_path(topic);
        mirror.push(SENTINEL.to_string());
        self.published_messages.update_path(&mirror, value.clone());
        self.queue.enqueue(topic, value);
    }

    /// Subscribe a selector and route its retained traffic into the store.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SubscribeDenied`] when the broker refuses.
    pub async fn subscribe(self: &Arc<Self>, selector: &str) -> Result<(), SyncError> {
        let selector = normalize_selector(selector);
        {
            let mut state = self.lock();
            if state.subscribed.iter().any(|s| s == &selector) {
                return Ok(());
            }
            // record first: retained messages may arrive while the
            // subscribe call is still in flight
            state.subscribed.push(selector.clone());
        }
        let result = self
            .client
            .subscribe(&selector, SubscribeOptions::default())
            .await
            .map_err(SyncError::from)
            .and_then(|grants| check_grants(&selector, &grants));
        if let Err(err) = result {
            self.lock().subscribed.retain(|s| s != &selector);
            return Err(err);
        }
        Ok(())
    }

    /// Remove a subscription added with [`subscribe`](MqttSync::subscribe).
    ///
    /// # Errors
    ///
    /// Returns an error when the broker client rejects the unsubscribe.
    pub async fn unsubscribe(self: &Arc<Self>, selector: &str) -> Result<(), SyncError> {
        let selector = normalize_selector(selector);
        self.lock().subscribed.retain(|s| s != &selector);
        self.client.unsubscribe(&selector).await?;
        Ok(())
    }

    /// Erase retained state under each of `prefixes`.
    ///
    /// Subscribes `prefix/#`, collects matching topics already seen plus any
    /// arriving within one heartbeat, optionally filters them, then clears
    /// each with a zero-length retained publish. Returns the cleared count.
    ///
    /// # Errors
    ///
    /// Returns an error when a clearing publish fails; collection-phase
    /// subscription failures are logged and skipped.
    pub async fn clear(
        self: &Arc<Self>,
        prefixes: &[&str],
        filter: Option<&(dyn Fn(&str) -> bool + Sync)>,
    ) -> Result<usize, SyncError> {
        if prefixes.is_empty() {
            return Ok(0);
        }
        let prefixes: Vec<String> = prefixes
            .iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .collect();
        for prefix in &prefixes {
            let topic = format!("{prefix}/#");
            match self.client.subscribe(&topic, SubscribeOptions::default()).await {
                Ok(grants) => {
                    if let Err(err) = check_grants(&topic, &grants) {
                        tracing::warn!(topic, error = %err, "clear subscription denied");
                    }
                }
                Err(err) => tracing::warn!(topic, error = %err, "clear subscription failed"),
            }
        }

        let collected = Arc::new(Mutex::new(BTreeSet::new()));
        let listener_id = {
            let mut state = self.lock();
            {
                let mut collected = collected.lock().expect("clear set lock poisoned");
                for topic in &state.received_topics {
                    if prefixes.iter().any(|p| topic_has_prefix(topic, p)) {
                        collected.insert(topic.clone());
                    }
                }
            }
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            let sink = collected.clone();
            let watched = prefixes.clone();
            state.message_listeners.push((
                id,
                Arc::new(move |topic: &str, _payload: &[u8]| {
                    if watched.iter().any(|p| topic_has_prefix(topic, p)) {
                        sink.lock()
                            .expect("clear set lock poisoned")
                            .insert(topic.to_string());
                    }
                }),
            ));
            id
        };

        self.wait_for_heartbeat_once().await;

        self.lock()
            .message_listeners
            .retain(|(id, _)| *id != listener_id);
        for prefix in &prefixes {
            let _ = self.client.unsubscribe(&format!("{prefix}/#")).await;
        }

        let topics: Vec<String> = {
            let collected = collected.lock().expect("clear set lock poisoned");
            collected
                .iter()
                .filter(|topic| filter.is_none_or(|f| f(topic.as_str())))
                .cloned()
                .collect()
        };
        for topic in &topics {
            self.client
                .publish(topic, &[], PublishOptions { qos: 1, retain: true })
                .await?;
        }
        tracing::debug!(count = topics.len(), "cleared retained topics");
        Ok(topics.len())
    }

    /// Rate-limit outbound publishes with a leading-and-trailing throttle.
    pub fn set_throttle(&self, interval: std::time::Duration) {
        self.queue.set_throttle(interval);
    }

    /// Restore immediate publishing.
    pub fn clear_throttle(&self) {
        self.queue.clear_throttle();
    }

    /// Register a hook to run synchronously before the client disconnects.
    pub fn on_before_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().disconnect_hooks.push(Arc::new(hook));
    }

    /// Run all registered disconnect hooks in registration order.
    pub fn before_disconnect(&self) {
        let hooks: Vec<DisconnectHook> = self.lock().disconnect_hooks.iter().cloned().collect();
        for hook in hooks {
            hook();
        }
    }
}

pub(crate) fn check_grants(topic: &str, grants: &[Grant]) -> Result<(), SyncError> {
    if let Some(denied) = grants.iter().find(|grant| grant.is_denied()) {
        return Err(SyncError::SubscribeDenied {
            topic: topic.to_string(),
            qos: denied.qos,
        });
    }
    Ok(())
}

fn sentinel_path(path: &[String]) -> Vec<String> {
    let mut out = path.to_vec();
    out.push(SENTINEL.to_string());
    out
}

fn topic_has_prefix(topic: &str, prefix: &str) -> bool {
    topic == prefix
        || topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn collect_sentinels(node: &Value, base: &str, out: &mut Vec<(String, Value)>) {
    if let Value::Object(map) = node {
        for (key, child) in map {
            if key == SENTINEL {
                out.push((base.to_string(), child.clone()));
            } else {
                collect_sentinels(child, &join_topic(base, &encode_topic_element(key)), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_prefix_matching_is_boundary_aware() {
        assert!(topic_has_prefix("/a/b", "/a"));
        assert!(topic_has_prefix("/a", "/a"));
        assert!(!topic_has_prefix("/ab", "/a"));
        assert!(!topic_has_prefix("/b/a", "/a"));
    }

    #[test]
    fn grant_checking_reports_denials() {
        let ok = [Grant { topic: "/a/#".into(), qos: 1 }];
        assert!(check_grants("/a/#", &ok).is_ok());
        let denied = [Grant { topic: "/a/#".into(), qos: 0x80 }];
        assert!(matches!(
            check_grants("/a/#", &denied),
            Err(SyncError::SubscribeDenied { qos: 0x80, .. })
        ));
    }
}
