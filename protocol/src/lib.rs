//! Wire protocol shared by the realtime client and the in-process service.
//!
//! The realtime service speaks the Phoenix channel protocol over a WebSocket.
//! Every frame carries a topic, an event name, a JSON payload and two
//! optional references used to correlate replies with pushes.

mod auth;
mod channel;
mod frame;
pub mod presence;

pub use auth::{AuthApiError, PasswordCredentials, Session, User};
pub use channel::{
    BroadcastConfig, BroadcastMessage, ChannelConfig, ChannelState, HttpBroadcastMessage,
    HttpBroadcastRequest, JoinPayload, PresenceConfig, PresenceMessage, ReplyPayload, ReplyStatus,
};
pub use frame::{PhoenixMessage, ProtocolError, Serializer};
pub use presence::{PresenceDiff, PresenceEntry, PresenceMeta, PresenceState};

/// Protocol version advertised in the socket URL for JSON object frames.
pub const VSN_1: &str = "1.0.0";

/// Protocol version advertised in the socket URL for JSON array frames.
pub const VSN_2: &str = "2.0.0";

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the service puts in front of every channel name on the wire.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Reason the service gives when a private channel join is not authorized.
pub const PERMISSION_DENIED_REASON: &str = "You do not have permissions to read from this Topic";

/// Event names used on the wire.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const SYSTEM: &str = "system";
}

/// Build the wire topic for a channel name.
///
/// Names that already carry the prefix are returned unchanged.
pub fn realtime_topic(name: &str) -> String {
    if name.starts_with(TOPIC_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", TOPIC_PREFIX, name)
    }
}

/// Strip the wire prefix from a topic, yielding the channel name.
pub fn strip_realtime_prefix(topic: &str) -> &str {
    topic.strip_prefix(TOPIC_PREFIX).unwrap_or(topic)
}
