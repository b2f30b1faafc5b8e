//! # treesync Core
//!
//! Hierarchical document model for retained-state synchronization.
//!
//! This crate provides:
//! - Topic codec: slash-delimited wire topics ⇄ path arrays with per-segment
//!   percent escaping
//! - Selector matching with `+`, `+name`, `*`, and `#` wildcards
//! - Flattener/modifier mapping nested documents to per-leaf topics and back
//! - Deep merge with last-writer-wins leaves
//! - [`DataCache`]: an observable nested store with atomic and flat change
//!   notification channels

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod flatten;
pub mod matcher;
pub mod merge;
pub mod topic;

pub use cache::{DataCache, FlatChanges, ListenerId, Tags, EXTERNAL_TAG};
pub use flatten::{get_at_path, set_at_path, to_flat_object, unset_at_path, update_object};
pub use matcher::{is_sub_topic_of, match_paths, match_topics, Bindings};
pub use merge::deep_merge;
pub use topic::{
    decode_topic_element, encode_topic_element, join_topic, path_to_topic, topic_to_path,
};
