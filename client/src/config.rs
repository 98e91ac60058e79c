//! Client options.

use realtime_kit_protocol::{ChannelConfig, Serializer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Options for the realtime socket.
///
/// Field names on the wire follow the hosted client's option names so a
/// config written for it deserializes unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeOptions {
    /// Interval between `phoenix`/`heartbeat` pushes.
    pub heartbeat_interval_ms: u64,
    /// How long a push waits for its reply.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Frame layout version. `None` selects `1.0.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsn: Option<String>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            vsn: None,
        }
    }
}

impl RealtimeOptions {
    /// One-second heartbeat and push timeout, for smoke tests that should
    /// fail fast.
    pub fn harness_defaults() -> Self {
        Self::default()
            .with_heartbeat_interval_ms(1000)
            .with_timeout_ms(1000)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_vsn(mut self, vsn: impl Into<String>) -> Self {
        self.vsn = Some(vsn.into());
        self
    }

    pub(crate) fn serializer(&self) -> Result<Serializer, ConfigError> {
        match &self.vsn {
            None => Ok(Serializer::V1),
            Some(vsn) => Serializer::from_vsn(vsn)
                .map_err(|_| ConfigError::UnsupportedVersion(vsn.clone())),
        }
    }
}

/// Options passed to [`create_client`](crate::create_client).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOptions {
    pub realtime: RealtimeOptions,
    /// Config used by [`Client::channel`](crate::Client::channel).
    pub channel: ChannelConfig,
}

impl ClientOptions {
    pub fn with_realtime(mut self, realtime: RealtimeOptions) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_channel_defaults(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}
