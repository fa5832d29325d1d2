//! Identity record and account-creation input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rollcall_core::{DomainError, DomainResult, UserId};

/// Longest username accepted at creation time (in characters).
pub const MAX_USERNAME_LEN: usize = 64;

/// Longest password accepted at creation time (in bytes).
pub const MAX_PASSWORD_BYTES: usize = 256;

/// A user account as owned by the identity store.
///
/// # Invariants
/// - `username` is unique at creation time.
/// - `password_hash` is a PHC string produced by the credential service; the
///   plaintext is never stored.
/// - Records are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            username: username.into(),
            password_hash: password_hash.into(),
            created_at: Utc::now(),
        }
    }

    /// Public view of the record (no credential material).
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            created_at: self.created_at,
        }
    }
}

/// Identity assertion returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Input for account creation (plaintext password, hashed before storage).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
}

impl NewUser {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check the input shape before any hashing or storage work happens.
    pub fn validate(&self) -> DomainResult<()> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(DomainError::validation("username must not be empty"));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(DomainError::validation(format!(
                "username must be at most {MAX_USERNAME_LEN} characters"
            )));
        }
        if username != self.username {
            return Err(DomainError::validation(
                "username must not have leading or trailing whitespace",
            ));
        }
        if self.password.is_empty() {
            return Err(DomainError::validation("password must not be empty"));
        }
        if self.password.len() > MAX_PASSWORD_BYTES {
            return Err(DomainError::validation(format!(
                "password must be at most {MAX_PASSWORD_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

impl core::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
