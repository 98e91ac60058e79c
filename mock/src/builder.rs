use crate::error::ServiceError;
use crate::{MockService, PrivateTopicPolicy, ServiceConfig};

/// Builder for a [`MockService`].
///
/// # Example
///
/// ```ignore
/// let service = MockService::builder()
///     .user("test1@test.com", "test_test")
///     .spawn()?;
/// let client = create_client(&service.url(), service.anon_key(), options)?;
/// ```
pub struct MockServiceBuilder {
    config: ServiceConfig,
    users: Vec<(String, String)>,
}

impl MockServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
            users: Vec::new(),
        }
    }

    /// Set service configuration.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the address to bind. Default: `127.0.0.1:0`.
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Set the JWT signing secret.
    pub fn jwt_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.config.jwt_secret = secret.into();
        self
    }

    /// Set user session expiry in seconds. Default: 3600 (1 hour).
    pub fn token_expiry_secs(mut self, secs: u64) -> Self {
        self.config.token_expiry_secs = secs;
        self
    }

    /// Decide who may join private topics.
    pub fn private_topic_policy(mut self, policy: PrivateTopicPolicy) -> Self {
        self.config.private_topic_policy = policy;
        self
    }

    /// Register an account for the password grant.
    pub fn user(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push((email.into(), password.into()));
        self
    }

    /// Bind and start serving on a background thread.
    pub fn spawn(self) -> Result<MockService, ServiceError> {
        if self.config.jwt_secret.is_empty() {
            return Err(ServiceError::Config("jwt_secret must not be empty".to_string()));
        }
        MockService::start(self.config, self.users)
    }
}

impl Default for MockServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
