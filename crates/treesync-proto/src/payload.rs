//! JSON payload codec.
//!
//! Values are carried as JSON text. `null` is encoded as a zero-length
//! payload, so writing `null` and clearing a retained topic are the same
//! wire operation; a zero-length payload decodes back to `null`.

use serde_json::Value;

/// Payload decode failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// The payload is not valid UTF-8 and must be treated as opaque binary.
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    /// The payload is UTF-8 but not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Json(String),
}

/// Encode a value for the wire. `Null` encodes as the empty payload.
#[must_use]
pub fn encode_payload(value: &Value) -> Vec<u8> {
    if value.is_null() {
        return Vec::new();
    }
    serde_json::to_vec(value).unwrap_or_default()
}

/// Decode a wire payload. Zero-length decodes to `Null`.
///
/// # Errors
///
/// Returns [`PayloadError::NotUtf8`] for binary payloads and
/// [`PayloadError::Json`] for malformed JSON text.
pub fn decode_payload(bytes: &[u8]) -> Result<Value, PayloadError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| PayloadError::NotUtf8)?;
    serde_json::from_str(text).map_err(|err| PayloadError::Json(err.to_string()))
}
