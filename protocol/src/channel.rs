//! Channel-level payloads: join config, replies, broadcast and presence pushes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast options for a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Receive our own broadcasts back.
    #[serde(rename = "self", default)]
    pub self_broadcast: bool,
    /// Ask the service to acknowledge each broadcast with a reply.
    #[serde(default)]
    pub ack: bool,
}

/// Presence options for a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Key under which this client's presence is tracked. Empty lets the
    /// service pick one.
    #[serde(default)]
    pub key: String,
}

/// Channel configuration sent inside `phx_join`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub postgres_changes: Vec<Value>,
    /// Private channels are gated by the service's authorization policy.
    #[serde(default)]
    pub private: bool,
}

impl ChannelConfig {
    pub fn with_self_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast.self_broadcast = enabled;
        self
    }

    pub fn with_ack(mut self, enabled: bool) -> Self {
        self.broadcast.ack = enabled;
        self
    }

    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence.key = key.into();
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }
}

/// Payload of a `phx_join` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: ChannelConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Outcome carried by a `phx_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

/// Payload of a `phx_reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    /// Human-readable reason for an error reply.
    ///
    /// The service usually answers `{"reason": "..."}`; anything else is
    /// flattened into a comma-separated list of its values.
    pub fn reason(&self) -> String {
        match &self.response {
            Value::Object(map) => {
                if let Some(Value::String(reason)) = map.get("reason") {
                    return reason.clone();
                }
                let parts: Vec<String> = map
                    .values()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                if parts.is_empty() {
                    "error".to_string()
                } else {
                    parts.join(", ")
                }
            }
            Value::String(s) => s.clone(),
            Value::Null => "error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

/// Body of a `broadcast` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: crate::events::BROADCAST.to_string(),
            event: event.into(),
            payload,
        }
    }
}

/// Body of a `presence` push (track / untrack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PresenceMessage {
    pub fn track(payload: Value) -> Self {
        Self {
            kind: crate::events::PRESENCE.to_string(),
            event: "track".to_string(),
            payload: Some(payload),
        }
    }

    pub fn untrack() -> Self {
        Self {
            kind: crate::events::PRESENCE.to_string(),
            event: "untrack".to_string(),
            payload: None,
        }
    }
}

/// One message for the REST broadcast endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBroadcastMessage {
    /// Channel name without the `realtime:` prefix.
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub private: bool,
}

/// Body of `POST /realtime/v1/api/broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBroadcastRequest {
    pub messages: Vec<HttpBroadcastMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn self_broadcast_serializes_as_self() {
        let config = ChannelConfig::default().with_self_broadcast(true);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["broadcast"], json!({"self": true, "ack": false}));
        assert_eq!(value["private"], json!(false));
    }

    #[test]
    fn join_payload_omits_missing_token() {
        let join = JoinPayload {
            config: ChannelConfig::default(),
            access_token: None,
        };
        let value = serde_json::to_value(&join).unwrap();
        assert!(value.get("access_token").is_none());
    }

    #[test]
    fn reply_reason_prefers_reason_field() {
        let reply: ReplyPayload = serde_json::from_value(json!({
            "status": "error",
            "response": {"reason": "You do not have permissions to read from this Topic"}
        }))
        .unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.reason(), crate::PERMISSION_DENIED_REASON);
    }

    #[test]
    fn reply_reason_joins_other_values() {
        let reply = ReplyPayload {
            status: ReplyStatus::Error,
            response: json!({"a": "first", "b": 2}),
        };
        assert_eq!(reply.reason(), "first, 2");
    }

    #[test]
    fn broadcast_message_type_field() {
        let msg = BroadcastMessage::new("ping", json!({}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "broadcast");
        assert_eq!(value["event"], "ping");
    }

    #[test]
    fn untrack_has_no_payload() {
        let value = serde_json::to_value(PresenceMessage::untrack()).unwrap();
        assert_eq!(value, json!({"type": "presence", "event": "untrack"}));
    }
}
