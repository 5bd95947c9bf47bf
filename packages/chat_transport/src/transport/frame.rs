//! JSON envelope framing for the chat socket.
//!
//! Envelope: `{ "v": 1, "type": "REQUEST" | "RESPONSE", ... }`
//!
//! Bodies are opaque bytes and travel base64-encoded. Header lists are
//! `name:value` strings, in order.

use serde::{Deserialize, Serialize};

use crate::request::Headers;

/// Current envelope version.
pub const PROTOCOL_VERSION: u32 = 1;

pub const MESSAGE_PATH: &str = "/api/v1/message";
pub const QUEUE_EMPTY_PATH: &str = "/api/v1/queue/empty";
pub const KEEPALIVE_PATH: &str = "/v1/keepalive";
pub const DELIVERY_TIMESTAMP_HEADER: &str = "X-Delivery-Timestamp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    message: WireMessage,
}

/// One frame on the chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    Request(RequestFrame),
    Response(ResponseFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub verb: String,
    pub path: String,
    pub id: u64,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default, with = "body_base64", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl RequestFrame {
    pub fn headers(&self) -> Headers {
        Headers::from_lines(&self.headers)
    }

    pub fn is(&self, verb: &str, path: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb) && self.path == path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default, with = "body_base64", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl ResponseFrame {
    /// `200 OK` acknowledgement of a server push.
    pub fn ack(id: u64) -> Self {
        Self {
            id,
            status: 200,
            message: "OK".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn headers(&self) -> Headers {
        Headers::from_lines(&self.headers)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
}

pub fn encode(message: &WireMessage) -> Result<String, FrameError> {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        message: message.clone(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<WireMessage, FrameError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.v != PROTOCOL_VERSION {
        tracing::warn!(version = envelope.v, "unknown envelope version");
        return Err(FrameError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.message)
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
