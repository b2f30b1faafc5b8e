//! Lenient dotted-version ordering for namespace migration.

use std::cmp::Ordering;

/// A dotted numeric version of up to three components.
///
/// Missing components rank as zero, so a partially specified version orders
/// as its minimum possible value: `"1.2"` sorts exactly like `"1.2.0"`.
/// The original string is retained for display.
#[derive(Debug, Clone)]
pub struct LooseVersion {
    parts: [u64; 3],
    raw: String,
}

impl LooseVersion {
    /// Parse `"1"`, `"1.2"`, or `"1.2.3"`.
    ///
    /// Returns `None` when the string is empty, has more than three
    /// components, or any present component is non-numeric.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let mut parts = [0u64; 3];
        for (i, piece) in raw.split('.').enumerate() {
            if i >= 3 {
                return None;
            }
            parts[i] = piece.parse().ok()?;
        }
        Some(Self {
            parts,
            raw: raw.to_string(),
        })
    }

    /// The original version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for LooseVersion {}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(raw: &str) -> LooseVersion {
        LooseVersion::parse(raw).unwrap()
    }

    #[test]
    fn ascending_order() {
        let mut versions = vec![version("1.1.0"), version("0.9.9"), version("1.0.0")];
        versions.sort();
        let ordered: Vec<&str> = versions.iter().map(LooseVersion::as_str).collect();
        assert_eq!(ordered, vec!["0.9.9", "1.0.0", "1.1.0"]);
    }

    #[test]
    fn partial_versions_rank_as_minimum() {
        assert_eq!(version("1.2"), version("1.2.0"));
        assert!(version("1.2") < version("1.2.1"));
        assert!(version("1") < version("1.0.1"));
    }

    #[test]
    fn invalid_versions_rejected() {
        assert!(LooseVersion::parse("").is_none());
        assert!(LooseVersion::parse("1.x.0").is_none());
        assert!(LooseVersion::parse("1.2.3.4").is_none());
        assert!(LooseVersion::parse("latest").is_none());
    }
}
