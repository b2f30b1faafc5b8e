//! Ordered, per-topic deduplicated queue of retained publishes.
//!
//! Entries drain in insertion order; re-enqueueing a topic replaces its
//! pending value without moving it, so rapid updates to one topic can never
//! publish an older value after a newer one while clears-before-writes
//! ordering across topics is preserved.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use treesync_proto::encode_payload;

use crate::mqtt::{MqttClient, PublishOptions};

/// Delay before retrying the head entry after a disconnected or failed
/// publish.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// QoS used for retained sync publishes.
const SYNC_QOS: u8 = 1;

struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, Value>,
    draining: bool,
    throttle: Option<Duration>,
    last_drain: Option<Instant>,
    trailing_scheduled: bool,
}

struct Shared {
    client: Arc<dyn MqttClient>,
    state: Mutex<QueueState>,
}

/// Serializes outbound retained publishes for one engine.
#[derive(Clone)]
pub struct PublicationQueue {
    shared: Arc<Shared>,
}

impl PublicationQueue {
    /// Create a queue publishing through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn MqttClient>) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                state: Mutex::new(QueueState {
                    order: VecDeque::new(),
                    pending: HashMap::new(),
                    draining: false,
                    throttle: None,
                    last_drain: None,
                    trailing_scheduled: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().expect("queue lock poisoned")
    }

    /// Queue `value` for `topic`. `Null` clears the retained message.
    pub fn enqueue(&self, topic: &str, value: Value) {
        {
            let mut state = self.lock();
            if state.pending.insert(topic.to_string(), value).is_none() {
                state.order.push_back(topic.to_string());
            }
        }
        self.trigger();
    }

    /// Number of topics with a pending publish.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Rate-limit draining with a leading-and-trailing throttle.
    pub fn set_throttle(&self, interval: Duration) {
        self.lock().throttle = Some(interval);
    }

    /// Restore immediate draining.
    pub fn clear_throttle(&self) {
        self.lock().throttle = None;
    }

    fn trigger(&self) {
        let mut state = self.lock();
        if state.draining {
            return;
        }
        match state.throttle {
            None => self.start_drain(&mut state),
            Some(interval) => match state.last_drain {
                Some(last) if Instant::now().duration_since(last) < interval => {
                    if !state.trailing_scheduled {
                        state.trailing_scheduled = true;
                        let wait = interval - Instant::now().duration_since(last);
                        let queue = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(wait).await;
                            let mut state = queue.lock();
                            state.trailing_scheduled = false;
                            state.last_drain = Some(Instant::now());
                            if !state.draining {
                                queue.start_drain(&mut state);
                            }
                        });
                    }
                }
                _ => {
                    state.last_drain = Some(Instant::now());
                    self.start_drain(&mut state);
                }
            },
        }
    }

    fn start_drain(&self, state: &mut QueueState) {
        state.draining = true;
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self) {
        loop {
            let (topic, value) = {
                let mut state = self.lock();
                match state.order.front() {
                    None => {
                        state.draining = false;
                        return;
                    }
                    Some(topic) => {
                        let topic = topic.clone();
                        let value = state.pending.get(&topic).cloned().unwrap_or(Value::Null);
                        (topic, value)
                    }
                }
            };
            if !self.shared.client.connected() {
                tracing::warn!(topic, "broker disconnected; retrying publish later");
                self.schedule_retry();
                return;
            }
            let payload = encode_payload(&value);
            let result = self
                .shared
                .client
                .publish(
                    &topic,
                    &payload,
                    PublishOptions {
                        qos: SYNC_QOS,
                        retain: true,
                    },
                )
                .await;
            match result {
                Ok(()) => {
                    let mut state = self.lock();
                    // a newer value may have been queued while publishing;
                    // keep the entry so the next iteration sends it
                    if state.pending.get(&topic) == Some(&value) {
                        state.pending.remove(&topic);
                        if let Some(pos) = state.order.iter().position(|t| t == &topic) {
                            state.order.remove(pos);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(topic, error = %err, "publish failed; retrying later");
                    self.schedule_retry();
                    return;
                }
            }
        }
    }

    fn schedule_retry(&self) {
        self.lock().draining = false;
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            queue.trigger();
        });
    }
}
