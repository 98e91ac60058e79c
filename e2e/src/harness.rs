//! Test harness: configuration, per-test clients and small async helpers.

use realtime_kit_client::{
    create_client, ChannelConfig, Client, ClientError, ClientOptions, ConfigError,
    RealtimeOptions, ServiceUrls,
};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub const ENV_PROJECT_URL: &str = "PROJECT_URL";
pub const ENV_PROJECT_ANON_TOKEN: &str = "PROJECT_ANON_TOKEN";

/// Account the permission scenario signs in with.
pub const TEST_USER_EMAIL: &str = "test1@test.com";
pub const TEST_USER_PASSWORD: &str = "test_test";

/// How long a scenario waits for an expected message.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Fail with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl Into<String>) -> Result<(), HarnessError> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Assertion(message.into()))
    }
}

/// Project URL and anon key, validated once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    project_url: String,
    anon_token: String,
}

impl HarnessConfig {
    pub fn new(project_url: &str, anon_token: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| match name {
            ENV_PROJECT_URL => Some(project_url.to_string()),
            ENV_PROJECT_ANON_TOKEN => Some(anon_token.to_string()),
            _ => None,
        })
    }

    /// Read `PROJECT_URL` and `PROJECT_ANON_TOKEN` from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the variables through `lookup`. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
        };

        let project_url = required(ENV_PROJECT_URL)?;
        let anon_token = required(ENV_PROJECT_ANON_TOKEN)?;
        ServiceUrls::parse(&project_url)?;

        Ok(Self {
            project_url,
            anon_token,
        })
    }

    pub fn project_url(&self) -> &str {
        &self.project_url
    }

    pub fn anon_token(&self) -> &str {
        &self.anon_token
    }
}

/// Load a `.env` file from the working directory or its parents, if any.
pub fn load_env_file() -> Option<PathBuf> {
    match dotenv::dotenv() {
        Ok(path) => {
            tracing::debug!("Loaded environment from {}", path.display());
            Some(path)
        }
        Err(_) => None,
    }
}

/// Install a test-friendly tracing subscriber. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// One-second heartbeat and timeout, self broadcast on.
pub fn harness_options() -> ClientOptions {
    ClientOptions::default()
        .with_realtime(RealtimeOptions::harness_defaults())
        .with_channel_defaults(ChannelConfig::default().with_self_broadcast(true))
}

/// Hands each test case its own client and cleans up after it.
pub struct TestHarness {
    config: HarnessConfig,
    options: ClientOptions,
}

impl TestHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            options: harness_options(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// A fresh client. Nothing is connected yet.
    pub fn acquire(&self) -> Result<Client, HarnessError> {
        Ok(create_client(
            self.config.project_url(),
            self.config.anon_token(),
            self.options.clone(),
        )?)
    }

    /// Leave all channels, close the socket and forget the session.
    pub async fn release(&self, client: Client) -> Result<(), HarnessError> {
        let result = client.realtime().remove_all_channels().await;
        if client.realtime().is_connected() {
            client.realtime().disconnect();
        }
        client.auth().clear_session();
        result?;
        Ok(())
    }

    /// Run `scenario` with a fresh client, releasing it afterwards.
    ///
    /// A scenario failure wins over a release failure.
    pub async fn run<F, Fut>(&self, scenario: F) -> Result<(), HarnessError>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<(), HarnessError>>,
    {
        let client = self.acquire()?;
        let outcome = scenario(client.clone()).await;
        let released = self.release(client).await;
        outcome?;
        released
    }
}

/// Random topic name, `topic:<uuid>`.
pub fn random_topic() -> String {
    format!("topic:{}", uuid::Uuid::new_v4())
}

pub fn random_event() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Wait up to `timeout` for the next value on `rx`.
pub async fn recv_within<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    timeout: Duration,
    what: &str,
) -> Result<T, HarnessError> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(HarnessError::Assertion(format!("{} listener dropped", what))),
        Err(_) => Err(HarnessError::Timeout(what.to_string())),
    }
}
