//! Round-trip against a real broker. Skipped unless `TREESYNC_INTEGRATION`
//! is set; point `TREESYNC_MQTT_BROKER` at a broker that serves
//! `$SYS/broker/uptime` (mosquitto does).

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use treesync_client::{MqttSync, MqttSyncOptions, PublishedOptions};
use treesync_rumqttc::{run_event_loop, RumqttcClient, RumqttcConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retained_round_trip() {
    if std::env::var("TREESYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set TREESYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("TREESYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let namespace = format!("/it-{}", Uuid::new_v4());

    // publisher side
    let config = RumqttcConfig {
        broker_url: broker.clone(),
        client_id: format!("pub-{}", Uuid::new_v4()),
        keep_alive: Duration::from_secs(5),
    };
    let (publisher_client, publisher_eventloop) = RumqttcClient::new(&config);
    let publisher = MqttSync::new(
        publisher_client.clone(),
        MqttSyncOptions {
            ignore_retain: true,
            ..Default::default()
        },
    );
    tokio::spawn(run_event_loop(
        publisher_client,
        publisher_eventloop,
        publisher.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;

    publisher.start().await.unwrap();
    publisher
        .publish(&format!("{namespace}/#"), PublishedOptions::default())
        .await
        .unwrap();
    publisher.data.update(&format!("{namespace}/b"), json!(1));
    tokio::time::sleep(Duration::from_millis(500)).await;

    // subscriber side, fresh session
    let config = RumqttcConfig {
        broker_url: broker,
        client_id: format!("sub-{}", Uuid::new_v4()),
        keep_alive: Duration::from_secs(5),
    };
    let (subscriber_client, subscriber_eventloop) = RumqttcClient::new(&config);
    let subscriber = MqttSync::new(
        subscriber_client.clone(),
        MqttSyncOptions {
            ignore_retain: true,
            ..Default::default()
        },
    );
    tokio::spawn(run_event_loop(
        subscriber_client,
        subscriber_eventloop,
        subscriber.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;

    subscriber.start().await.unwrap();
    subscriber.subscribe(&format!("{namespace}/#")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        subscriber.data.get_by_topic(&format!("{namespace}/b")),
        Some(json!(1))
    );

    // leave no retained state behind
    let cleared = subscriber
        .clear(&[namespace.as_str()], None)
        .await
        .unwrap();
    assert!(cleared >= 1);
}
