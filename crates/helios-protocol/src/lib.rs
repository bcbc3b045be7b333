// helios-protocol: wire frame types, codec helpers, and the topic matcher.
//
// All WebSocket frames use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the three message genres
// multiplexed over one connection: request/response RPC and fire-and-forget
// events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod pattern;

// ---------------------------------------------------------------------------
// Message genres
// ---------------------------------------------------------------------------

/// A correlated RPC call.
///
/// `id` doubles as the correlation id: the reply carries it back in
/// `request_id`.  Outgoing constructors always mint a non-empty id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The reply to a [`Request`], matched by `request_id`.
///
/// Failed calls are still a `Response`; the failure is encoded in the
/// payload (see [`error_payload`]), never as a separate frame kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A fire-and-forget, topic-addressed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame kinds in the protocol.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "request", "id": "...", "method": "...", "payload": {} }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response(Response),
    Event(EventMessage),
}

impl Frame {
    /// Build an outgoing request with a freshly minted id.
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame::Request(Request {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            payload,
        })
    }

    /// Build the reply to `request_id` with a freshly minted id.
    pub fn response(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame::Response(Response {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            payload,
        })
    }

    /// Build an outgoing event with a freshly minted id.
    pub fn event(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame::Event(EventMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
        })
    }

    /// The frame's own id, whatever the genre.
    pub fn id(&self) -> &str {
        match self {
            Frame::Request(r) => &r.id,
            Frame::Response(r) => &r.id,
            Frame::Event(e) => &e.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame decode: {0}")]
    Decode(serde_json::Error),
    #[error("frame encode: {0}")]
    Encode(serde_json::Error),
}

/// Parse one text frame into a typed [`Frame`].
pub fn parse_frame(raw: &str) -> Result<Frame, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}

/// Serialize a typed [`Frame`] back to its text representation.
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(ProtocolError::Encode)
}

// ---------------------------------------------------------------------------
// Structured error codes
// ---------------------------------------------------------------------------

/// Error code strings carried inside error-shaped payloads.
pub mod error_codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const ROOM_UNDECLARED: &str = "ROOM_UNDECLARED";
    pub const VALIDATOR_ERROR: &str = "VALIDATOR_ERROR";
    pub const SESSION_INVALID: &str = "SESSION_INVALID";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
}

/// The error shape carried in a failed response's payload:
/// `{"error": {"code": ..., "message": ...}}`.
pub fn error_payload(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}
