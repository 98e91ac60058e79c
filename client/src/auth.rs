//! Auth sub-client: password sign-in and sign-out.

use crate::api::{fetch, parse_response, post_json, ServiceUrls};
use crate::error::AuthError;
use crate::ClientError;
use parking_lot::RwLock;
use realtime_kit_protocol::{AuthApiError, PasswordCredentials, Session, User};
use std::sync::Arc;

/// Result of a successful sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub user: User,
    pub session: Session,
}

/// Client for the auth endpoints. Holds the current session.
///
/// Cloning shares the session.
#[derive(Clone)]
pub struct AuthClient {
    urls: ServiceUrls,
    api_key: String,
    session: Arc<RwLock<Option<Session>>>,
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("url", &self.urls.auth(""))
            .field("signed_in", &self.session.read().is_some())
            .finish()
    }
}

impl AuthClient {
    pub fn new(urls: ServiceUrls, api_key: &str) -> Self {
        Self {
            urls,
            api_key: api_key.to_string(),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Sign in with an email/password pair and keep the session.
    pub async fn sign_in_with_password(
        &self,
        credentials: &PasswordCredentials,
    ) -> Result<AuthResponse, ClientError> {
        let url = self.urls.auth("token?grant_type=password");
        let request = post_json(url, credentials, &self.api_key, None)?;
        let response = fetch(request).await?;

        if !response.ok {
            return Err(auth_error(response.status, &response.bytes).into());
        }

        let session: Session = parse_response(response)?;

        tracing::info!(
            "Signed in as {} (user {})",
            session.user.email.as_deref().unwrap_or("<no email>"),
            session.user.id
        );

        *self.session.write() = Some(session.clone());
        Ok(AuthResponse {
            user: session.user.clone(),
            session,
        })
    }

    /// Revoke the current session and forget it locally.
    ///
    /// The local session is cleared even when the service call fails.
    pub async fn sign_out(&self) -> Result<(), ClientError> {
        let Some(session) = self.session.write().take() else {
            return Err(AuthError::NoSession.into());
        };

        let url = self.urls.auth("logout");
        let request = post_json(
            url,
            &serde_json::json!({}),
            &self.api_key,
            Some(&session.access_token),
        )?;
        let response = fetch(request).await?;

        // Already revoked counts as signed out.
        if !response.ok && response.status != 401 && response.status != 404 {
            return Err(auth_error(response.status, &response.bytes).into());
        }

        tracing::info!("Signed out user {}", session.user.id);
        Ok(())
    }

    /// Drop the local session without calling the service.
    pub fn clear_session(&self) {
        self.session.write().take();
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.access_token.clone())
    }
}

fn auth_error(status: u16, bytes: &[u8]) -> AuthError {
    let body: AuthApiError = serde_json::from_slice(bytes).unwrap_or_default();
    if body.is_invalid_credentials() {
        return AuthError::InvalidCredentials(body.message());
    }
    let message = if body == AuthApiError::default() {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        body.message()
    };
    AuthError::Api { status, message }
}
