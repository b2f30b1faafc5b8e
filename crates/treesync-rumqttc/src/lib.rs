//! # treesync rumqttc adapter
//!
//! [`rumqttc`]-backed implementation of the `MqttClient` seam, plus the
//! event-loop pump that feeds inbound messages into an engine.
//!
//! MQTT 3.1.1 has no retain-as-published subscribe option, so the broker
//! strips the retain flag from live forwards; pair this adapter with
//! `ignore_retain` on the engine when live updates must sync.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use tokio::sync::oneshot;

use treesync_client::{Grant, MqttClient, MqttError, MqttSync, PublishOptions, SubscribeOptions};

/// Connection settings for [`RumqttcClient`].
#[derive(Debug, Clone)]
pub struct RumqttcConfig {
    /// Broker URL, e.g. `tcp://localhost:1883`.
    pub broker_url: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
}

impl Default for RumqttcConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: "treesync".to_string(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

type PendingGrant = (String, oneshot::Sender<Vec<Grant>>);

/// `MqttClient` implementation over a `rumqttc` [`AsyncClient`].
///
/// Subscription grants are correlated with broker SUBACKs in FIFO order by
/// the event-loop pump.
pub struct RumqttcClient {
    client: AsyncClient,
    connected: AtomicBool,
    pending: Mutex<VecDeque<PendingGrant>>,
}

impl RumqttcClient {
    /// Create the client and its event loop.
    ///
    /// The event loop must be handed to [`run_event_loop`] for anything to
    /// make progress.
    #[must_use]
    pub fn new(config: &RumqttcConfig) -> (Arc<Self>, EventLoop) {
        let (host, port) = parse_mqtt_url(&config.broker_url);
        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(config.keep_alive);
        let (client, eventloop) = AsyncClient::new(options, 100);
        (
            Arc::new(Self {
                client,
                connected: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
            }),
            eventloop,
        )
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<Grant>, MqttError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push_back((topic.to_string(), tx));
        self.client
            .subscribe(topic, qos_level(options.qos))
            .await
            .map_err(|err| MqttError::Client(err.to_string()))?;
        rx.await.map_err(|_| MqttError::Disconnected)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos_level(options.qos), options.retain, payload.to_vec())
            .await
            .map_err(|err| MqttError::Client(err.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|err| MqttError::Client(err.to_string()))
    }
}

/// Pump the event loop, forwarding publishes into the sync engine.
///
/// Runs until the process ends. Errors back off for five seconds before
/// polling resumes; `rumqttc` reconnects internally.
pub async fn run_event_loop(
    adapter: Arc<RumqttcClient>,
    mut eventloop: EventLoop,
    sync: Arc<MqttSync>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                adapter.connected.store(true, Ordering::SeqCst);
                tracing::info!("Connected to MQTT broker");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                sync.handle_message(&publish.topic, &publish.payload, publish.retain);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let pending = adapter
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .pop_front();
                if let Some((topic, sender)) = pending {
                    let grants = ack
                        .return_codes
                        .iter()
                        .map(|code| Grant {
                            topic: topic.clone(),
                            qos: match code {
                                SubscribeReasonCode::Success(qos) => *qos as u8,
                                SubscribeReasonCode::Failure => 0x80,
                            },
                        })
                        .collect();
                    let _ = sender.send(grants);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                adapter.connected.store(false, Ordering::SeqCst);
                tracing::warn!("Broker sent disconnect");
            }
            Ok(_) => {}
            Err(err) => {
                adapter.connected.store(false, Ordering::SeqCst);
                tracing::error!(error = %err, "MQTT error");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Parse an MQTT URL into host and port.
fn parse_mqtt_url(url: &str) -> (String, u16) {
    let url = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let parts: Vec<&str> = url.split(':').collect();

    let host = parts.first().copied().unwrap_or("localhost").to_string();
    let port = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(1883);

    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mqtt_url_tcp() {
        let (host, port) = parse_mqtt_url("tcp://localhost:1883");
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_default_port() {
        let (host, port) = parse_mqtt_url("mqtt://broker.example.com");
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_no_scheme() {
        let (host, port) = parse_mqtt_url("localhost:1884");
        assert_eq!(host, "localhost");
        assert_eq!(port, 1884);
    }

    #[test]
    fn qos_levels_map() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_level(7), QoS::AtMostOnce);
    }
}
