//! # treesync Protocol
//!
//! Wire conventions shared by every peer syncing through the broker.
//!
//! ## Payloads
//!
//! Leaves travel as JSON text; `null` is a zero-length payload, making a
//! `null` write and a retained-message clear the same operation.
//!
//! ## Topics
//!
//! Reserved names (`$SYS/broker/uptime` heartbeat, `$_` mirror sentinel),
//! selector normalization, the capability topic schema, and the RPC
//! request/response topic pair.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod payload;
pub mod rpc;
pub mod topics;
pub mod version;

pub use payload::{decode_payload, encode_payload, PayloadError};
pub use rpc::{correlation_id, RpcRequest, RpcResponse};
pub use topics::{
    normalize_selector, request_topic, response_topic, CapabilityTopic, HEARTBEAT_TOPIC, SENTINEL,
    VERSION_SEGMENT_INDEX,
};
pub use version::LooseVersion;
