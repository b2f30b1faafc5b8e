//! The broker-client seam consumed by the sync engine.
//!
//! The engine never connects, reconnects, or tears the client down; it only
//! subscribes, publishes, and unsubscribes. Inbound traffic is delivered by
//! the embedder calling `MqttSync::handle_message` for every message the
//! client receives.

use async_trait::async_trait;

/// Options for a broker subscription.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Requested QoS level.
    pub qos: u8,
    /// Retain-as-published: ask the broker to preserve the retain flag on
    /// forwarded messages (MQTT 5 brokers only).
    pub rap: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { qos: 1, rap: true }
    }
}

/// Options for an outbound publish.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// QoS level.
    pub qos: u8,
    /// Whether the broker should retain the message.
    pub retain: bool,
}

/// Per-topic subscription grant mirrored from the broker's SUBACK.
#[derive(Debug, Clone)]
pub struct Grant {
    /// The granted topic filter.
    pub topic: String,
    /// Granted QoS; values of `0x80` and above signal denial.
    pub qos: u8,
}

impl Grant {
    /// Whether the broker refused this subscription.
    #[must_use]
    pub fn is_denied(&self) -> bool {
        self.qos >= 0x80
    }
}

/// Errors surfaced by a broker client implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// The client is not connected to the broker.
    #[error("not connected to broker")]
    Disconnected,
    /// Transport or protocol failure reported by the client.
    #[error("client error: {0}")]
    Client(String),
}

/// Contract the sync engine requires of an MQTT client.
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Current connection state.
    fn connected(&self) -> bool;

    /// Subscribe to a topic filter; the grant vector mirrors the SUBACK.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<Grant>, MqttError>;

    /// Publish raw bytes. A zero-length retained payload clears the topic.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), MqttError>;

    /// Remove a subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;
}
