use thiserror::Error;

/// Failures starting the service or handling its tokens.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Bind failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service failed to start: {0}")]
    Startup(String),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The token was signed out.
    #[error("Token revoked")]
    Revoked,

    #[error("Invalid service configuration: {0}")]
    Config(String),
}
