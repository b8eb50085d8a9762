use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::attempt::{AttemptResult, ErrorClass, HeaderList, InboundAttempt};

/// Capabilities this client announces in its `hello`.
pub const CAPABILITIES: &[&str] = &["chunked_attempts", "truncation"];

/// Close code the dispatcher uses to reject an expired or revoked session.
pub const CLOSE_REAUTH_REQUIRED: u16 = 4001;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to (de)serialize frame")]
    Serialization(#[from] serde_json::Error),
}

/// One protocol frame, carried as a websocket text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    Welcome(Welcome),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Attempt(AttemptFrame),
    AttemptChunk(AttemptChunk),
    AttemptResult(AttemptResultFrame),
    Control(Control),
    Bye(Bye),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub session_id: String,
    pub token: String,
    pub client_version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(default = "default_true")]
    pub session_valid: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFrame {
    pub attempt_id: String,
    pub connection_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub ordinal: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Body continues in `attempt_chunk` frames.
    #[serde(default)]
    pub more_chunks: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptChunk {
    pub attempt_id: String,
    pub seq: u32,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResultFrame {
    pub attempt_id: String,
    pub connection_id: String,
    pub status: Option<u16>,
    pub headers: HeaderList,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    pub truncated: bool,
    pub error: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    RateLimit,
    SessionRevoked,
    Drain,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub kind: ControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bye {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Frame {
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Welcome(_) => "welcome",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Attempt(_) => "attempt",
            Frame::AttemptChunk(_) => "attempt_chunk",
            Frame::AttemptResult(_) => "attempt_result",
            Frame::Control(_) => "control",
            Frame::Bye(_) => "bye",
            Frame::Unknown => "unknown",
        }
    }
}

impl From<AttemptFrame> for InboundAttempt {
    fn from(frame: AttemptFrame) -> Self {
        Self {
            attempt_id: frame.attempt_id,
            connection_id: frame.connection_id,
            method: frame.method,
            path: frame.path,
            query: frame.query,
            headers: frame.headers,
            body: frame.body,
            requested_at: frame.requested_at,
            ordinal: frame.ordinal,
            event_id: frame.event_id,
        }
    }
}

impl From<&AttemptResult> for AttemptResultFrame {
    fn from(result: &AttemptResult) -> Self {
        Self {
            attempt_id: result.attempt_id.clone(),
            connection_id: result.connection_id.clone(),
            status: result.status,
            headers: result.headers.clone(),
            body: result.body.clone(),
            truncated: result.truncated,
            error: result.error,
            reason: result.reason.clone(),
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            finished_at: result.finished_at,
        }
    }
}

impl From<&AttemptResult> for Frame {
    fn from(result: &AttemptResult) -> Self {
        Frame::AttemptResult(result.into())
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
