//! Topic codec: bidirectional conversion between wire topics and path arrays.
//!
//! Wire form is `"/" + join("/", encoded segments)`. Segments are
//! percent-escaped so that arbitrary strings survive the round trip:
//! `%` becomes `%25` and `/` becomes `%2F`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet};

/// Characters that must be percent-encoded in a topic segment: the escape
/// character itself and the segment delimiter.
const TOPIC_ELEMENT_ESCAPE: &AsciiSet = &AsciiSet::EMPTY.add(b'%').add(b'/');

/// Encode a single path segment for use in a topic string.
#[must_use]
pub fn encode_topic_element(segment: &str) -> String {
    utf8_percent_encode(segment, TOPIC_ELEMENT_ESCAPE).to_string()
}

/// Decode a single topic segment back to its original form.
///
/// Inverse of [`encode_topic_element`]. Percent sequences that do not form
/// valid UTF-8 decode lossily.
#[must_use]
pub fn decode_topic_element(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Convert a path (sequence of segments) to its wire topic form.
///
/// Produces a leading slash and percent-encodes every segment. Named
/// wildcards (`+name`) are emitted as bare `+`; `*` is kept verbatim, since
/// wildcard namespaces never appear on the wire but the two grammars stay
/// distinct.
#[must_use]
pub fn path_to_topic<S: AsRef<str>>(path: &[S]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut topic = String::new();
    for segment in path {
        let segment = segment.as_ref();
        topic.push('/');
        if segment.len() >= 2 && segment.starts_with('+') {
            topic.push('+');
        } else {
            topic.push_str(&encode_topic_element(segment));
        }
    }
    topic
}

/// Join a base topic and a relative (already encoded) key.
#[must_use]
pub fn join_topic(base: &str, key: &str) -> String {
    if base == "/" {
        format!("/{key}")
    } else {
        format!("{base}/{key}")
    }
}

/// Parse a wire topic into its path segments.
///
/// Strips the leading and trailing slash, drops empty segments, and decodes
/// each remaining one. `+` and `#` are not interpreted here; wildcards are
/// selector grammar, not topic grammar.
#[must_use]
pub fn topic_to_path(topic: &str) -> Vec<String> {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(decode_topic_element)
        .collect()
}
