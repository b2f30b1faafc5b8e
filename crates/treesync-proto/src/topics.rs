//! Reserved topics, selector normalization, and the capability topic schema.
//!
//! Capability topics follow `/org/device/@scope/name/version/sub…`; the
//! version always sits at segment index 4, with wildcards permitted before
//! it but not after.

use serde::{Deserialize, Serialize};
use treesync_core::{path_to_topic, topic_to_path};

/// Broker heartbeat topic: a retained message the broker refreshes
/// periodically. Used to gate ordering of reconciliation steps.
pub const HEARTBEAT_TOPIC: &str = "$SYS/broker/uptime";

/// Reserved sentinel segment used by the published-message mirror so that a
/// value at `/a` and a value at `/a/b` can be tracked side by side. Must not
/// appear as an application segment.
pub const SENTINEL: &str = "$_";

/// Segment index of the version component in a capability topic.
pub const VERSION_SEGMENT_INDEX: usize = 4;

/// Normalize a selector to cover a whole subtree: append `/#` when absent.
#[must_use]
pub fn normalize_selector(selector: &str) -> String {
    let trimmed = selector.trim_end_matches('/');
    if trimmed.ends_with("/#") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/#")
    }
}

/// Topic carrying requests for `command`.
#[must_use]
pub fn request_topic(command: &str) -> String {
    format!("{}/request", command.trim_end_matches('/'))
}

/// Topic carrying the response to the request correlated by `id`.
#[must_use]
pub fn response_topic(command: &str, id: &str) -> String {
    format!("{}/response/{id}", command.trim_end_matches('/'))
}

/// Parsed capability topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTopic {
    /// Organization segment.
    pub organization: String,
    /// Device segment.
    pub device: String,
    /// Capability scope, including the leading `@`.
    pub scope: String,
    /// Capability name.
    pub name: String,
    /// Version namespace.
    pub version: String,
    /// Remaining segments below the version.
    pub sub_path: Vec<String>,
}

impl CapabilityTopic {
    /// Parse a topic following the capability schema.
    ///
    /// Returns `None` when the topic is too short or the scope segment does
    /// not start with `@`.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let path = topic_to_path(topic);
        if path.len() <= VERSION_SEGMENT_INDEX {
            return None;
        }
        if !path[2].starts_with('@') {
            return None;
        }
        Some(Self {
            organization: path[0].clone(),
            device: path[1].clone(),
            scope: path[2].clone(),
            name: path[3].clone(),
            version: path[4].clone(),
            sub_path: path[VERSION_SEGMENT_INDEX + 1..].to_vec(),
        })
    }

    /// Reassemble the wire topic.
    #[must_use]
    pub fn to_topic(&self) -> String {
        let mut path = vec![
            self.organization.clone(),
            self.device.clone(),
            self.scope.clone(),
            self.name.clone(),
            self.version.clone(),
        ];
        path.extend(self.sub_path.iter().cloned());
        path_to_topic(&path)
    }
}

impl std::fmt::Display for CapabilityTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_topic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_hash() {
        assert_eq!(normalize_selector("/a/b"), "/a/b/#");
        assert_eq!(normalize_selector("/a/b/"), "/a/b/#");
        assert_eq!(normalize_selector("/a/b/#"), "/a/b/#");
    }

    #[test]
    fn rpc_topic_builders() {
        assert_eq!(request_topic("/sq"), "/sq/request");
        assert_eq!(response_topic("/sq", "abc"), "/sq/response/abc");
    }

    #[test]
    fn capability_topic_roundtrip() {
        let parsed = CapabilityTopic::parse("/org/dev/@scope/cap/1.2.0/x/y").unwrap();
        assert_eq!(parsed.organization, "org");
        assert_eq!(parsed.device, "dev");
        assert_eq!(parsed.scope, "@scope");
        assert_eq!(parsed.name, "cap");
        assert_eq!(parsed.version, "1.2.0");
        assert_eq!(parsed.sub_path, vec!["x", "y"]);
        assert_eq!(parsed.to_topic(), "/org/dev/@scope/cap/1.2.0/x/y");
    }

    #[test]
    fn capability_topic_rejects_bad_shapes() {
        assert!(CapabilityTopic::parse("/org/dev/@scope/cap").is_none());
        assert!(CapabilityTopic::parse("/org/dev/scope/cap/1.0.0/x").is_none());
    }
}
