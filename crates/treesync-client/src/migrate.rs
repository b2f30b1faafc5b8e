//! Version-namespace migration: merge retained data from older version keys
//! into a new namespace, then clear the obsolete keys.
//!
//! Migration topics follow the capability schema, so the version component
//! sits at a fixed segment index; wildcards are allowed before it but not
//! after.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use treesync_core::{deep_merge, encode_topic_element, path_to_topic, to_flat_object, topic_to_path};
use treesync_proto::{encode_payload, LooseVersion, VERSION_SEGMENT_INDEX};

use crate::mqtt::PublishOptions;
use crate::sync::{MqttSync, SyncError};

/// Transform applied to a merged document before republication.
pub type MigrationTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// One migration item: merge all version namespaces matching `topic` into
/// `new_version`.
#[derive(Clone)]
pub struct Migration {
    /// Capability selector addressing the data below one version namespace.
    pub topic: String,
    /// Version namespace receiving the merged document.
    pub new_version: String,
    /// Optional rewrite of the merged document before it is republished.
    pub transform: Option<MigrationTransform>,
    /// Publish each leaf as its own retained message.
    pub flat: bool,
    /// Depth below the target at which subdocuments publish atomically:
    /// `0` writes the whole document at once, `1` one message per child, …
    /// Ignored when `flat` is set.
    pub level: usize,
}

impl Migration {
    /// Migration of `topic` into `new_version`, published as one atomic
    /// document.
    #[must_use]
    pub fn new(topic: impl Into<String>, new_version: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            new_version: new_version.into(),
            transform: None,
            flat: false,
            level: 0,
        }
    }
}

impl MqttSync {
    /// Run migration items in order, resolving when all have completed.
    ///
    /// A denied or malformed item is logged and skipped so the remaining
    /// items (and readiness) still complete.
    pub async fn migrate(self: &Arc<Self>, migrations: &[Migration]) {
        for migration in migrations {
            if let Err(err) = self.run_migration(migration).await {
                tracing::warn!(topic = %migration.topic, error = %err, "migration item skipped");
            }
        }
    }

    /// Configured-migration entry point: run the items, then report ready
    /// one heartbeat later.
    pub(crate) async fn run_migrations(self: Arc<Self>, migrations: Vec<Migration>) {
        self.migrate(&migrations).await;
        self.wait_for_heartbeat_once().await;
        self.fire_ready();
    }

    async fn run_migration(self: &Arc<Self>, migration: &Migration) -> Result<(), SyncError> {
        let path = topic_to_path(&migration.topic);
        if path.len() <= VERSION_SEGMENT_INDEX {
            return Err(SyncError::InvalidMigration(migration.topic.clone()));
        }
        let Some(new_version) = LooseVersion::parse(&migration.new_version) else {
            return Err(SyncError::InvalidMigration(format!(
                "unparseable target version {}",
                migration.new_version
            )));
        };
        let prefix = &path[..VERSION_SEGMENT_INDEX];
        let suffix = &path[VERSION_SEGMENT_INDEX + 1..];

        // subscribe every version of the namespace at once
        let mut all_versions = prefix.to_vec();
        all_versions.push("+".to_string());
        all_versions.extend(suffix.iter().cloned());
        let selector = path_to_topic(&all_versions);
        if let Err(err) = self.subscribe(&selector).await {
            tracing::warn!(selector, error = %err, "migration subscribe failed; item completes without effect");
            return Ok(());
        }
        // retained data is in by the next heartbeat
        self.wait_for_heartbeat_once().await;

        let mut grounded: Vec<(Vec<String>, Vec<String>)> = Vec::new();
        self.data.for_match_path(prefix, |node, concrete, _bindings| {
            if let Value::Object(map) = node {
                grounded.push((concrete.to_vec(), map.keys().cloned().collect()));
            }
        });

        let mut obsolete: Vec<String> = Vec::new();
        for (concrete_prefix, versions) in grounded {
            let mut parsed: Vec<LooseVersion> = versions
                .iter()
                .filter_map(|v| LooseVersion::parse(v))
                .filter(|v| *v <= new_version)
                .collect();
            parsed.sort();
            if parsed.is_empty() {
                continue;
            }

            // ascending merge: later versions win per leaf
            let mut merged = Value::Null;
            for version in &parsed {
                let mut source = concrete_prefix.clone();
                source.push(version.as_str().to_string());
                source.extend(suffix.iter().cloned());
                if let Some(doc) = self.data.get_path(&source) {
                    if merged.is_null() {
                        merged = doc;
                    } else {
                        deep_merge(&mut merged, &doc);
                    }
                }
            }
            if merged.is_null() {
                continue;
            }
            if let Some(transform) = &migration.transform {
                merged = transform(merged);
            }

            let mut target = concrete_prefix.clone();
            target.push(migration.new_version.clone());
            target.extend(suffix.iter().cloned());
            let target_topic = path_to_topic(&target);
            if migration.flat {
                match &merged {
                    Value::Object(_) => {
                        for (key, leaf) in to_flat_object(&merged) {
                            self.publish_retained(&format!("{target_topic}/{key}"), &leaf)
                                .await?;
                        }
                    }
                    leaf => self.publish_retained(&target_topic, leaf).await?,
                }
            } else {
                self.publish_at_level(&target_topic, &merged, migration.level)
                    .await?;
            }
            tracing::info!(
                target = %target_topic,
                versions = parsed.len(),
                "merged version namespaces"
            );

            for version in &parsed {
                if *version < new_version {
                    let mut old = concrete_prefix.clone();
                    old.push(version.as_str().to_string());
                    old.extend(suffix.iter().cloned());
                    obsolete.push(path_to_topic(&old));
                }
            }
        }

        self.unsubscribe(&selector).await?;
        // let our own publishes land before clearing the old namespaces
        self.wait_for_heartbeat_once().await;
        if !obsolete.is_empty() {
            let prefixes: Vec<&str> = obsolete.iter().map(String::as_str).collect();
            let cleared = self.clear(&prefixes, None).await?;
            tracing::info!(topic = %migration.topic, cleared, "cleared obsolete version namespaces");
        }
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, value: &Value) -> Result<(), SyncError> {
        self.client
            .publish(
                topic,
                &encode_payload(value),
                PublishOptions {
                    qos: 1,
                    retain: true,
                },
            )
            .await?;
        Ok(())
    }

    fn publish_at_level<'a>(
        &'a self,
        topic: &'a str,
        value: &'a Value,
        level: usize,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            if level == 0 {
                return self.publish_retained(topic, value).await;
            }
            if let Value::Object(map) = value {
                for (key, child) in map {
                    let child_topic = format!("{topic}/{}", encode_topic_element(key));
                    self.publish_at_level(&child_topic, child, level - 1).await?;
                }
                Ok(())
            } else {
                self.publish_retained(topic, value).await
            }
        })
    }
}
