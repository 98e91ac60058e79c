//! Error types for the realtime client.

use thiserror::Error;

/// Main client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Receive failed: {0}")]
    Receive(#[from] ReceiveError),

    #[error("Disconnected: {0}")]
    Disconnected(#[from] DisconnectReason),

    #[error("Auth failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

/// Errors that occur during connection establishment.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Server rejected request: {0}")]
    ServerRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors that occur when sending frames or REST requests.
#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Errors that occur when receiving frames or responses.
#[derive(Error, Debug, Clone)]
pub enum ReceiveError {
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

/// Errors from the auth endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid login credentials: {0}")]
    InvalidCredentials(String),

    #[error("No active session")]
    NoSession,

    #[error("Auth API error {status}: {message}")]
    Api { status: u16, message: String },
}

/// Errors raised while building a client from configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Empty API key")]
    EmptyKey,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// Reasons for disconnection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("Connection closed by server")]
    ServerClosed,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Client closed connection")]
    ClientClosed,
}

/// Current state of the socket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Connection lost.
    Lost(DisconnectReason),
}

impl ConnectionState {
    /// Returns true if the connection is established and healthy.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if the connection was lost (not just disconnected).
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectionState::Lost(_))
    }

    /// Returns the disconnect reason if the connection was lost.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        match self {
            ConnectionState::Lost(reason) => Some(reason),
            _ => None,
        }
    }
}
