//! Top-level client bundling the auth and realtime sub-clients.

use crate::api::ServiceUrls;
use crate::auth::AuthClient;
use crate::config::ClientOptions;
use crate::error::ConfigError;
use crate::realtime::{RealtimeChannel, RealtimeClient};
use crate::ClientError;

/// Handle to one project: a URL plus its public API key.
///
/// Nothing touches the network until a sub-client is used.
#[derive(Clone)]
pub struct Client {
    urls: ServiceUrls,
    api_key: String,
    options: ClientOptions,
    auth: AuthClient,
    realtime: RealtimeClient,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.urls.base())
            .field("auth", &self.auth)
            .field("realtime", &self.realtime)
            .finish()
    }
}

/// Build a client for the project at `url`.
///
/// Fails on a malformed URL, an empty key or an unknown protocol version.
pub fn create_client(url: &str, api_key: &str, options: ClientOptions) -> Result<Client, ClientError> {
    let urls = ServiceUrls::parse(url)?;
    if api_key.trim().is_empty() {
        return Err(ConfigError::EmptyKey.into());
    }

    let realtime = RealtimeClient::new(&urls, api_key, options.realtime.clone())?;
    let auth = AuthClient::new(urls.clone(), api_key);
    tracing::debug!("Created client for {}", urls.base());

    Ok(Client {
        urls,
        api_key: api_key.to_string(),
        options,
        auth,
        realtime,
    })
}

impl Client {
    pub fn url(&self) -> &str {
        self.urls.base()
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    /// Create a channel with the client's default channel config.
    pub fn channel(&self, name: &str) -> RealtimeChannel {
        self.realtime.channel(name, self.options.channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeOptions;
    use realtime_kit_protocol::{ChannelConfig, ChannelState};

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            create_client("not a url", "anon", ClientOptions::default()),
            Err(ClientError::Config(ConfigError::InvalidUrl { .. }))
        ));
        assert!(matches!(
            create_client("http://localhost:54321", "  ", ClientOptions::default()),
            Err(ClientError::Config(ConfigError::EmptyKey))
        ));

        let options = ClientOptions::default()
            .with_realtime(RealtimeOptions::default().with_vsn("9.9.9"));
        assert!(matches!(
            create_client("http://localhost:54321", "anon", options),
            Err(ClientError::Config(ConfigError::UnsupportedVersion(_)))
        ));
    }

    #[test]
    fn channels_use_default_config_and_start_closed() {
        let options = ClientOptions::default()
            .with_channel_defaults(ChannelConfig::default().with_self_broadcast(true));
        let client = create_client("http://localhost:54321/", "anon", options).unwrap();

        let channel = client.channel("room-1");
        assert_eq!(channel.topic(), "realtime:room-1");
        assert!(channel.config().broadcast.self_broadcast);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(client.realtime().channels().len(), 1);
        assert!(!client.realtime().is_connected());
    }

    #[test]
    fn debug_output_shows_realtime_settings() {
        let options = ClientOptions::default().with_realtime(
            RealtimeOptions::default()
                .with_heartbeat_interval_ms(1000)
                .with_timeout_ms(1000),
        );
        let client = create_client("http://localhost:54321", "anon", options).unwrap();
        let rendered = format!("{:?}", client.realtime());
        assert!(rendered.contains("ws://localhost:54321/realtime/v1/websocket"));
        assert!(rendered.contains("heartbeat_interval_ms: 1000"));
    }
}
