//! Phoenix frame encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// A single Phoenix channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    #[serde(default)]
    pub join_ref: Option<String>,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }

    /// Build the reply to this frame, keeping both references.
    pub fn reply(&self, status: &str, response: Value) -> Self {
        Self {
            join_ref: self.join_ref.clone(),
            msg_ref: self.msg_ref.clone(),
            topic: self.topic.clone(),
            event: crate::events::REPLY.to_string(),
            payload: serde_json::json!({ "status": status, "response": response }),
        }
    }
}

/// Text frame layout negotiated through the `vsn` socket parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    /// `{"topic":..,"event":..,"payload":..,"ref":..,"join_ref":..}`
    #[default]
    V1,
    /// `[join_ref, ref, topic, event, payload]`
    V2,
}

impl Serializer {
    pub fn from_vsn(vsn: &str) -> Result<Self, ProtocolError> {
        match vsn {
            crate::VSN_1 => Ok(Serializer::V1),
            crate::VSN_2 => Ok(Serializer::V2),
            other => Err(ProtocolError::UnsupportedVersion(other.to_string())),
        }
    }

    pub fn vsn(&self) -> &'static str {
        match self {
            Serializer::V1 => crate::VSN_1,
            Serializer::V2 => crate::VSN_2,
        }
    }

    pub fn encode(&self, msg: &PhoenixMessage) -> String {
        match self {
            Serializer::V1 => {
                serde_json::to_string(msg).unwrap_or_else(|_| String::from("{}"))
            }
            Serializer::V2 => serde_json::json!([
                msg.join_ref,
                msg.msg_ref,
                msg.topic,
                msg.event,
                msg.payload
            ])
            .to_string(),
        }
    }

    /// Decode a text frame. Either layout is accepted regardless of `self`,
    /// since the service answers in the layout the frame was sent in.
    pub fn decode(&self, text: &str) -> Result<PhoenixMessage, ProtocolError> {
        match text.trim_start().as_bytes().first() {
            Some(b'[') => {
                let (join_ref, msg_ref, topic, event, payload): (
                    Option<String>,
                    Option<String>,
                    String,
                    String,
                    Value,
                ) = serde_json::from_str(text)
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
                Ok(PhoenixMessage {
                    join_ref,
                    msg_ref,
                    topic,
                    event,
                    payload,
                })
            }
            Some(b'{') => serde_json::from_str(text)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string())),
            _ => Err(ProtocolError::MalformedFrame(format!(
                "expected JSON object or array, got {:?}",
                text.chars().take(16).collect::<String>()
            ))),
        }
    }
}
