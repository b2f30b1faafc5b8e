//! RPC wire messages and correlation tokens.
//!
//! A command topic `C` carries requests on `C/request` and responses on
//! `C/response/<id>`. Both payloads are JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Request carried on `<command>/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation token tying the request to its response topic.
    pub id: String,
    /// Handler arguments, arbitrary JSON.
    pub args: Value,
}

/// Response carried on `<command>/response/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation token echoed from the request.
    pub id: String,
    /// Handler result, arbitrary JSON.
    pub result: Value,
}

/// Generate a short correlation token: 48 random bits rendered in base 36.
#[must_use]
pub fn correlation_id() -> String {
    let bits = (Uuid::new_v4().as_u128() & 0xffff_ffff_ffff) as u64;
    to_base36(bits)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn request_roundtrip() {
        let request = RpcRequest {
            id: correlation_id(),
            args: json!({"n": 5}),
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: RpcRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, request.id);
        assert_eq!(decoded.args, request.args);
    }

    #[test]
    fn response_roundtrip() {
        let response = RpcResponse {
            id: "abc123".to_string(),
            result: json!(25),
        };
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: RpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, "abc123");
        assert_eq!(decoded.result, json!(25));
    }

    #[test]
    fn correlation_ids_are_unique_and_base36() {
        let ids: BTreeSet<String> = (0..1000).map(|_| correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(id.len() <= 10);
        }
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
