use crate::capabilities::Capabilities;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Every `type` the decoder accepts, aliases included.
pub const KNOWN_TYPES: &[&str] = &[
    "authenticate",
    "authentication_success",
    "generate_image",
    "dispatch_request",
    "request_accepted",
    "image_generated",
    "request_completed",
    "request_failed",
    "ping",
    "pong",
    "error",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Cli,
    Extension,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Cli => "cli",
            ClientType::Extension => "extension",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Authenticate(AuthenticatePayload),
    AuthenticationSuccess(AuthenticationSuccessPayload),
    #[serde(alias = "dispatch_request")]
    GenerateImage(DispatchPayload),
    RequestAccepted(AcceptedPayload),
    #[serde(alias = "request_completed")]
    ImageGenerated(CompletionPayload),
    RequestFailed(FailurePayload),
    Ping(PingPayload),
    Pong(PingPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub client_type: ClientType,
    pub id: String,
    #[serde(default)]
    pub metadata: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSuccessPayload {
    pub client_id: String,
    pub message: String,
}

/// Request body. Clients may omit `requestId`/`correlationId` on submit; the
/// coordinator fills both in before dispatching to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Capabilities::is_empty")]
    pub requires: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedPayload {
    pub request_id: String,
    pub correlation_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub request_id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailurePayload {
    pub request_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WireMessage {
    pub fn error(request_id: Option<&str>, code: &str, message: impl Into<String>) -> Self {
        WireMessage::Error(ErrorPayload {
            request_id: request_id.map(str::to_string),
            message: message.into(),
            code: Some(code.to_string()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Authenticate(_) => "authenticate",
            WireMessage::AuthenticationSuccess(_) => "authentication_success",
            WireMessage::GenerateImage(_) => "generate_image",
            WireMessage::RequestAccepted(_) => "request_accepted",
            WireMessage::ImageGenerated(_) => "image_generated",
            WireMessage::RequestFailed(_) => "request_failed",
            WireMessage::Ping(_) => "ping",
            WireMessage::Pong(_) => "pong",
            WireMessage::Error(_) => "error",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            WireMessage::GenerateImage(payload) => payload.request_id.as_deref(),
            WireMessage::RequestAccepted(payload) => Some(&payload.request_id),
            WireMessage::ImageGenerated(payload) => Some(&payload.request_id),
            WireMessage::RequestFailed(payload) => Some(&payload.request_id),
            WireMessage::Error(payload) => payload.request_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("message encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Oversized { .. } => "message_too_large",
            ProtocolError::Malformed(_) => "malformed_message",
            ProtocolError::UnknownType(_) => "unknown_message",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::Encode(_) => "encode_failed",
        }
    }
}

pub fn encode_message(message: &WireMessage, max_bytes: usize) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > max_bytes {
        return Err(ProtocolError::Oversized {
            size: encoded.len(),
            max: max_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes one text frame. The `type` field is checked before the payload so a
/// caller can tell an unknown message apart from a broken known one.
pub fn decode_message(bytes: &[u8], max_bytes: usize) -> Result<WireMessage, ProtocolError> {
    if bytes.len() > max_bytes {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::Malformed("missing type field".to_string())),
    };
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|err| ProtocolError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatch() -> WireMessage {
        WireMessage::GenerateImage(DispatchPayload {
            request_id: Some("req-1".to_string()),
            prompt: "a lighthouse at dusk".to_string(),
            model: Some("a".to_string()),
            parameters: json!({"width": 512}),
            correlation_id: Some("corr-1".to_string()),
            requires: Capabilities::new(),
            timeout_ms: None,
        })
    }

    #[test]
    fn fields_use_camel_case_on_the_wire() {
        let encoded = encode_message(&dispatch(), DEFAULT_MAX_MESSAGE_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "generate_image");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["correlationId"], "corr-1");
        assert_eq!(value["parameters"]["width"], 512);
        assert!(value.get("requires").is_none());

        let decoded = decode_message(encoded.as_bytes(), DEFAULT_MAX_MESSAGE_BYTES)
            .expect("decode");
        assert_eq!(decoded, dispatch());
    }

    #[test]
    fn generic_aliases_decode_to_the_same_variants() {
        let raw = br#"{"type":"dispatch_request","requestId":"r","prompt":"p"}"#;
        let decoded = decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES).expect("dispatch alias");
        assert_eq!(decoded.kind(), "generate_image");
        assert_eq!(decoded.request_id(), Some("r"));

        let raw = br#"{"type":"request_completed","requestId":"r","result":{"url":"x"}}"#;
        let decoded = decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES).expect("completed alias");
        let WireMessage::ImageGenerated(payload) = decoded else {
            panic!("expected completion");
        };
        assert_eq!(payload.result["url"], "x");
        assert!(payload.metadata.is_null());
    }

    #[test]
    fn authenticate_accepts_missing_or_null_metadata() {
        let raw = br#"{"type":"authenticate","clientType":"extension","id":"w1","metadata":null}"#;
        let WireMessage::Authenticate(payload) =
            decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES).expect("decode")
        else {
            panic!("expected authenticate");
        };
        assert_eq!(payload.client_type, ClientType::Extension);
        assert!(payload.metadata.is_empty());

        let raw = br#"{"type":"authenticate","clientType":"cli","id":"c1"}"#;
        let decoded = decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES).expect("decode");
        assert_eq!(decoded.kind(), "authenticate");
    }

    #[test]
    fn decode_classifies_failures() {
        let malformed = decode_message(b"{not json", DEFAULT_MAX_MESSAGE_BYTES);
        assert!(matches!(malformed, Err(ProtocolError::Malformed(_))));

        let untyped = decode_message(br#"{"requestId":"r"}"#, DEFAULT_MAX_MESSAGE_BYTES);
        assert!(matches!(untyped, Err(ProtocolError::Malformed(_))));

        let unknown = decode_message(br#"{"type":"teleport"}"#, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(
            unknown,
            Err(ProtocolError::UnknownType("teleport".to_string()))
        );

        let invalid = decode_message(br#"{"type":"generate_image"}"#, DEFAULT_MAX_MESSAGE_BYTES);
        match invalid {
            Err(err @ ProtocolError::InvalidPayload { .. }) => {
                assert_eq!(err.code(), "invalid_payload");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn oversized_messages_are_rejected_both_ways() {
        let big = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(256));
        let result = decode_message(big.as_bytes(), 64);
        assert!(matches!(result, Err(ProtocolError::Oversized { .. })));

        let result = encode_message(&dispatch(), 16);
        assert!(matches!(result, Err(ProtocolError::Oversized { size: _, max: 16 })));
    }

    #[test]
    fn error_helper_carries_request_id_and_code() {
        let message = WireMessage::error(Some("req-9"), "no_worker_available", "no worker");
        assert_eq!(message.request_id(), Some("req-9"));
        let encoded = encode_message(&message, DEFAULT_MAX_MESSAGE_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "no_worker_available");
        assert_eq!(value["message"], "no worker");
    }
}
