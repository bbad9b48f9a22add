//! Inbound notification events received over the upstream stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// One notification from upstream: `{ "id", "appid", "message", "title", "priority", "extras", "date" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub id: u64,
    /// Source application id, matched against each destination's allow-list.
    #[serde(default)]
    pub appid: u64,
    /// Required on the wire; may be empty.
    pub message: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl InboundEvent {
    /// Decode one text frame. Frames that do not start with a JSON object are rejected
    /// before parsing.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        if !frame.trim_start().starts_with('{') {
            return Err(DecodeError::NotAnObject);
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| DecodeError::NotUtf8)?;
        Self::decode(text)
    }
}
