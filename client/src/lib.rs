//! Client for a hosted realtime broadcast service.
//!
//! [`create_client`] returns a [`Client`] with two sub-clients: [`AuthClient`]
//! for password sign-in and [`RealtimeClient`] for the Phoenix-protocol
//! socket that carries broadcast and presence on named channels.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod realtime;
pub mod transport;

pub use api::{BroadcastEndpoint, ServiceUrls};
pub use auth::{AuthClient, AuthResponse};
pub use client::{create_client, Client};
pub use config::{ClientOptions, RealtimeOptions};
pub use error::{
    AuthError, ClientError, ConfigError, ConnectionError, ConnectionState, DisconnectReason,
    ReceiveError, SendError,
};
pub use realtime::{PresenceEvent, RealtimeChannel, RealtimeClient, SendStatus, SubscribeStatus};

pub use realtime_kit_protocol as protocol;
pub use realtime_kit_protocol::{
    BroadcastMessage, ChannelConfig, ChannelState, PasswordCredentials, PresenceState, Session,
    User,
};
