//! In-memory user accounts for the password grant.

use crate::tokens::ROLE_AUTHENTICATED;
use dashmap::DashMap;
use realtime_kit_protocol::User;
use serde_json::json;

struct Account {
    user: User,
    password: String,
}

/// Accounts keyed by email.
#[derive(Default)]
pub struct Accounts {
    by_email: DashMap<String, Account>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user. Re-registering an email replaces its password.
    pub fn insert(&self, email: &str, password: &str) -> User {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            aud: ROLE_AUTHENTICATED.to_string(),
            role: ROLE_AUTHENTICATED.to_string(),
            email: Some(email.to_string()),
            created_at: Some(crate::tokens::now_secs().to_string()),
            app_metadata: json!({ "provider": "email", "providers": ["email"] }),
            user_metadata: json!({}),
        };
        self.by_email.insert(
            email.to_lowercase(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    /// The user for `email` if `password` matches.
    pub fn verify(&self, email: &str, password: &str) -> Option<User> {
        self.by_email
            .get(&email.to_lowercase())
            .filter(|account| account.password == password)
            .map(|account| account.user.clone())
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}
