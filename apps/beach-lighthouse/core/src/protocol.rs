//! Heartbeat control frames exchanged with field devices.
//!
//! Devices send `{"type":"heartbeat","message":"ping","deviceId":"..."}` and the
//! hub answers `{"type":"pong"}`. Anything else arriving on the socket is a
//! [`FrameDecodeError`]; callers log and drop it without closing the socket.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Placeholder some device firmware sends when it has no identifier yet.
const UNKNOWN_DEVICE: &str = "Unknown";

/// Frames a device may send to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    /// Identifier reported in the frame, if any. Overrides the id the
    /// connection was opened with.
    pub device_id: Option<String>,
}

/// Frames the hub sends back to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong,
}

impl ServerFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("heartbeat frame carried message {0:?} instead of \"ping\"")]
    UnexpectedHeartbeat(Option<String>),
    #[error("unrecognized frame type `{0}`")]
    UnknownType(String),
}

impl FrameDecodeError {
    /// Short label used when counting decode failures.
    pub fn metric_label(&self) -> &'static str {
        match self {
            FrameDecodeError::InvalidJson(_) => "invalid_json",
            FrameDecodeError::NotUtf8(_) => "not_utf8",
            FrameDecodeError::NotAnObject => "not_an_object",
            FrameDecodeError::MissingType => "missing_type",
            FrameDecodeError::UnexpectedHeartbeat(_) => "unexpected_heartbeat",
            FrameDecodeError::UnknownType(_) => "unknown_type",
        }
    }
}

/// Decodes a text frame received from a device.
pub fn decode_frame(text: &str) -> Result<ClientFrame, FrameDecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(fields) = value else {
        return Err(FrameDecodeError::NotAnObject);
    };

    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameDecodeError::MissingType)?;

    match kind {
        "heartbeat" => decode_heartbeat(&fields).map(ClientFrame::Heartbeat),
        other => Err(FrameDecodeError::UnknownType(other.to_string())),
    }
}

/// Decodes a binary frame; some clients ship their JSON as binary messages.
pub fn decode_binary_frame(bytes: &[u8]) -> Result<ClientFrame, FrameDecodeError> {
    let text = std::str::from_utf8(bytes)?;
    decode_frame(text)
}

fn decode_heartbeat(fields: &Map<String, Value>) -> Result<Heartbeat, FrameDecodeError> {
    match fields.get("message").and_then(Value::as_str) {
        Some("ping") => {}
        other => {
            return Err(FrameDecodeError::UnexpectedHeartbeat(
                other.map(str::to_string),
            ))
        }
    }

    let device_id = match fields.get("deviceId") {
        Some(Value::String(id)) => normalize_device_id(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };

    Ok(Heartbeat { device_id })
}

/// Maps empty and placeholder identifiers to `None`.
pub fn normalize_device_id(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == UNKNOWN_DEVICE {
        None
    } else {
        Some(raw.to_string())
    }
}
