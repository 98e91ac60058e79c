//! JWT issuance and validation for anon keys and user sessions.

use crate::error::ServiceError;
use dashmap::DashSet;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use realtime_kit_protocol::User;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ROLE_ANON: &str = "anon";
pub const ROLE_AUTHENTICATED: &str = "authenticated";

/// Anon keys outlive any test run.
const ANON_KEY_EXPIRY_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    pub fn is_authenticated(&self) -> bool {
        self.role == ROLE_AUTHENTICATED
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs and checks HS256 tokens. Logged-out tokens are remembered as revoked.
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_secs: u64,
    revoked: DashSet<String>,
}

impl TokenManager {
    pub fn new(secret: &[u8], expiry_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            expiry_secs,
            revoked: DashSet::new(),
        }
    }

    pub fn expiry_secs(&self) -> u64 {
        self.expiry_secs
    }

    /// Public API key carrying the `anon` role.
    pub fn issue_anon(&self) -> Result<String, ServiceError> {
        let now = now_secs();
        let claims = Claims {
            role: ROLE_ANON.to_string(),
            sub: None,
            email: None,
            iat: now,
            exp: now + ANON_KEY_EXPIRY_SECS,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// Access token for a signed-in user.
    pub fn issue_for(&self, user: &User) -> Result<String, ServiceError> {
        let now = now_secs();
        let claims = Claims {
            role: ROLE_AUTHENTICATED.to_string(),
            sub: Some(user.id.clone()),
            email: user.email.clone(),
            iat: now,
            exp: now + self.expiry_secs,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    pub fn validate(&self, token: &str) -> Result<Claims, ServiceError> {
        if self.revoked.contains(token) {
            return Err(ServiceError::Revoked);
        }
        let mut validation = Validation::default();
        validation.validate_aud = false;
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    pub fn revoke(&self, token: &str) {
        self.revoked.insert(token.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: "u-1".into(),
            aud: "authenticated".into(),
            role: ROLE_AUTHENTICATED.into(),
            email: Some("test1@test.com".into()),
            created_at: None,
            app_metadata: Default::default(),
            user_metadata: Default::default(),
        }
    }

    #[test]
    fn anon_and_user_tokens_carry_roles() {
        let tokens = TokenManager::new(b"secret", 3600);

        let anon = tokens.validate(&tokens.issue_anon().unwrap()).unwrap();
        assert_eq!(anon.role, ROLE_ANON);
        assert!(!anon.is_authenticated());

        let claims = tokens.validate(&tokens.issue_for(&user()).unwrap()).unwrap();
        assert!(claims.is_authenticated());
        assert_eq!(claims.sub.as_deref(), Some("u-1"));
        assert_eq!(claims.email.as_deref(), Some("test1@test.com"));
    }

    #[test]
    fn revoked_and_foreign_tokens_are_rejected() {
        let tokens = TokenManager::new(b"secret", 3600);
        let token = tokens.issue_for(&user()).unwrap();
        tokens.revoke(&token);
        assert!(matches!(tokens.validate(&token), Err(ServiceError::Revoked)));

        let other = TokenManager::new(b"other", 3600);
        assert!(tokens.validate(&other.issue_anon().unwrap()).is_err());
    }
}
