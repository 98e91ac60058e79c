//! Realtime client: socket, channels, broadcast and presence.

mod channel;
mod socket;

pub use channel::{PresenceEvent, RealtimeChannel, SendStatus, SubscribeStatus};
pub use socket::{RealtimeClient, WS_CLOSE_NORMAL};
