//! WebSocket message protocol.
//!
//! Every frame is a JSON envelope `{"type", "id"?, "payload"}`. Inbound
//! frames are decoded exactly once into [`ClientMessage`]; outbound frames
//! are built from [`ServerMessage`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message type {0} requires a payload")]
    MissingPayload(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthRequest {
    pub app_key: String,
    pub machine_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstructionResult {
    pub instruction_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl InstructionResult {
    /// Text stored on the instruction: the result, or else the error.
    pub fn outcome_text(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(value_text)
            .or_else(|| self.error.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptResult {
    pub script_id: String,
    #[serde(default)]
    pub delivery_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<i64>,
}

impl ScriptResult {
    pub fn result_text(&self) -> Option<String> {
        self.result.as_ref().and_then(value_text)
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    Ping { id: Option<String> },
    InstructionResult(InstructionResult),
    ScriptResult(ScriptResult),
    Status(serde_json::Value),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, id, payload } = serde_json::from_str(text)?;

        match kind.as_str() {
            "auth" => Ok(Self::Auth(parse_payload(&kind, payload)?)),
            "ping" => Ok(Self::Ping { id }),
            "instruction_result" => Ok(Self::InstructionResult(parse_payload(&kind, payload)?)),
            "script_result" => Ok(Self::ScriptResult(parse_payload(&kind, payload)?)),
            "status" => Ok(Self::Status(match payload {
                Some(raw) => serde_json::from_str(raw.get())?,
                None => serde_json::Value::Null,
            })),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(
    kind: &str,
    payload: Option<Box<RawValue>>,
) -> Result<T, ProtocolError> {
    let raw = payload.ok_or_else(|| ProtocolError::MissingPayload(kind.to_string()))?;
    Ok(serde_json::from_str(raw.get())?)
}

/// A signed instruction as pushed to devices.
///
/// `payload` holds the exact JSON text that was signed, so the device can
/// rebuild the canonical message byte for byte.
#[derive(Debug, Clone, Serialize)]
pub struct SignedInstruction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Box<RawValue>,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
    pub expires: i64,
}

/// An outbound frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk { session_id: String },
    Error { message: String },
    Instruction(SignedInstruction),
    Pong { ts: i64 },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
