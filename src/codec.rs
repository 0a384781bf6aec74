// ABOUTME: Wire codec for the DingTalk stream gateway frame envelope.
// ABOUTME: Decodes inbound frames and builds acknowledgement frames; pure functions, no I/O.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Frame types delivered over the stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameType {
    System,
    Event,
    Callback,
    /// Anything the gateway sends that we don't recognize.
    Unknown(String),
}

impl FrameType {
    fn from_wire(raw: &str) -> Self {
        match raw {
            "SYSTEM" => FrameType::System,
            "EVENT" => FrameType::Event,
            "CALLBACK" => FrameType::Callback,
            other => FrameType::Unknown(other.to_string()),
        }
    }
}

/// One decoded frame from the stream connection.
///
/// Ephemeral: lives for the duration of one dispatch. `message_id` is the
/// correlation key for the mandatory acknowledgement; frames may arrive
/// without one (nothing to ack in that case).
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub topic: String,
    pub message_id: String,
    /// Raw payload. The gateway sends either a JSON string or an inline
    /// object; both are preserved here as a JSON string.
    pub data: String,
    pub headers: HashMap<String, String>,
}

/// Processing outcome reported back to the gateway for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    Failure,
}

impl AckOutcome {
    /// Fixed numeric status codes on the wire.
    pub fn code(self) -> u16 {
        match self {
            AckOutcome::Success => 200,
            AckOutcome::Failure => 500,
        }
    }
}

/// Decode one raw text frame from the socket.
///
/// A decode failure means no `messageId` can be recovered, so the caller's
/// only option is to log and drop the frame.
pub fn decode(raw: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(raw).context("Malformed frame JSON")?;

    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(FrameType::from_wire)
        .unwrap_or_else(|| FrameType::Unknown(String::new()));

    let mut headers = HashMap::new();
    if let Some(obj) = value.get("headers").and_then(Value::as_object) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                headers.insert(k.clone(), s.to_string());
            }
        }
    }

    let topic = headers.get("topic").cloned().unwrap_or_default();
    let message_id = headers.get("messageId").cloned().unwrap_or_default();

    let data = match value.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    Ok(Frame {
        frame_type,
        topic,
        message_id,
        data,
        headers,
    })
}

/// Build the acknowledgement envelope for one processed frame.
///
/// The `data` field carries a JSON-encoded *string* (double encoding). This
/// looks redundant but is part of the wire contract the platform expects;
/// do not flatten it.
pub fn encode_ack(message_id: &str, outcome: AckOutcome, note: &str) -> String {
    let inner = json!({
        "status": match outcome {
            AckOutcome::Success => "SUCCESS",
            AckOutcome::Failure => "FAILURE",
        },
        "message": note,
    });
    // Double-encoded by contract.
    let data = serde_json::to_string(&inner).unwrap_or_else(|_| "\"{}\"".to_string());

    let envelope = json!({
        "code": outcome.code(),
        "headers": {
            "messageId": message_id,
            "contentType": "application/json",
        },
        "message": note,
        "data": data,
    });
    envelope.to_string()
}

// =============================================================================
// Tests
// =============================================================================
