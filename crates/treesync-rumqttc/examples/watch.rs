//! Watch a region of broker retained state.
//!
//! ```sh
//! cargo run --example watch -- tcp://localhost:1883 "/org/+/status"
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use treesync_client::{FlatChanges, MqttSync, MqttSyncOptions};
use treesync_rumqttc::{run_event_loop, RumqttcClient, RumqttcConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let broker_url = args.next().context("usage: watch <broker-url> <selector>")?;
    let selector = args.next().context("usage: watch <broker-url> <selector>")?;

    let config = RumqttcConfig {
        broker_url,
        client_id: format!("treesync-watch-{}", Uuid::new_v4()),
        keep_alive: Duration::from_secs(30),
    };
    let (client, eventloop) = RumqttcClient::new(&config);

    let sync = MqttSync::new(
        client.clone(),
        MqttSyncOptions {
            ignore_retain: true,
            on_change: Some(Arc::new(|changes: &FlatChanges| {
                for (topic, value) in changes {
                    println!("{topic} = {value}");
                }
            })),
            ..Default::default()
        },
    );

    tokio::spawn(run_event_loop(client, eventloop, sync.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;

    sync.start().await.context("failed to start sync engine")?;
    sync.subscribe(&selector)
        .await
        .context("failed to subscribe selector")?;
    tracing::info!(selector, "watching; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    sync.before_disconnect();
    Ok(())
}
