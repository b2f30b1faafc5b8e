//! Selector matching against concrete paths.
//!
//! Selector grammar, per segment: `+` and `*` match exactly one segment,
//! `+name` matches one segment and binds it, `#` matches any tail and is
//! legal only in the last position.

use std::collections::BTreeMap;

use crate::topic::topic_to_path;

/// Named-wildcard bindings produced by a successful match.
pub type Bindings = BTreeMap<String, String>;

/// Match a selector path against a concrete path.
///
/// Returns `None` on mismatch. A successful match with no named wildcards
/// yields an empty map.
#[must_use]
pub fn match_paths<S: AsRef<str>, T: AsRef<str>>(selector: &[S], path: &[T]) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    for (i, sel) in selector.iter().enumerate() {
        let sel = sel.as_ref();
        if sel == "#" {
            // matches any tail, including the empty one
            return (i + 1 == selector.len()).then_some(bindings);
        }
        let segment = path.get(i)?.as_ref();
        match sel {
            "+" | "*" => {}
            _ if sel.len() >= 2 && sel.starts_with('+') => {
                bindings.insert(sel[1..].to_string(), segment.to_string());
            }
            _ => {
                if sel != segment {
                    return None;
                }
            }
        }
    }
    (selector.len() == path.len()).then_some(bindings)
}

/// Match a selector topic against a concrete topic (wire strings).
#[must_use]
pub fn match_topics(selector: &str, topic: &str) -> Option<Bindings> {
    match_paths(&topic_to_path(selector), &topic_to_path(topic))
}

/// `true` when `parent`'s path is a proper prefix of `sub`'s (never equal).
#[must_use]
pub fn is_sub_topic_of(sub: &str, parent: &str) -> bool {
    let sub = topic_to_path(sub);
    let parent = topic_to_path(parent);
    sub.len() > parent.len() && sub.iter().zip(parent.iter()).all(|(a, b)| a == b)
}
