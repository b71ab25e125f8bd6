//! Portal account credentials.

use std::fmt;

use serde::Deserialize;

/// Credentials for one portal user. Held in memory only.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    pub username: String,
    pub token: String,
}

impl Account {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    /// `Authorization` header attached to every request of a session.
    pub fn authorization(&self) -> (String, String) {
        ("Authorization".to_string(), format!("Bearer {}", self.token))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}
