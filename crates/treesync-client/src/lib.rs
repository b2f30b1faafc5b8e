//! # treesync Client
//!
//! State synchronization over an MQTT broker's retained-message space.
//!
//! Cooperating processes treat the broker as a shared hierarchical
//! key-value document: each peer publishes a region of its local
//! [`DataCache`](treesync_core::DataCache) as retained messages and
//! subscribes to the regions it wants mirrored in. On top of the same
//! topics sit a request/response RPC facility and a version-namespace
//! migration procedure.
//!
//! The MQTT client itself is an external collaborator behind the
//! [`MqttClient`] trait; this crate never connects or reconnects.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod migrate;
pub mod mqtt;
pub mod queue;
mod rpc;
pub mod sync;

pub use migrate::{Migration, MigrationTransform};
pub use mqtt::{Grant, MqttClient, MqttError, PublishOptions, SubscribeOptions};
pub use queue::PublicationQueue;
pub use treesync_core::{Bindings, DataCache, FlatChanges, Tags};
pub use sync::{
    ChangeHook, HeartbeatGrantedHook, MqttSync, MqttSyncOptions, PublishedOptions, ReadyHook,
    SyncError,
};
