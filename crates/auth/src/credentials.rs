//! Credential service: the one place passwords and bearer tokens are handled.

use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::Serialize;
use thiserror::Error;

use rollcall_core::UserId;

use crate::claims::TokenClaims;
use crate::password::{self, PasswordParams};
use crate::token::{self, InvalidToken, TokenType};

/// Access token validity (24 hours).
pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 1440;

/// Refresh token validity (30 days).
pub const DEFAULT_REFRESH_TTL_MINUTES: i64 = 43_200;

/// Longest accepted token validity (10 years).
pub const MAX_TTL_MINUTES: i64 = 5_256_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("signing secret must not be empty")]
    EmptySecret,

    #[error("invalid password hashing parameters: {0}")]
    InvalidParams(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("token ttl out of range: {0} minutes")]
    InvalidTtl(i64),
}

fn ttl_from_minutes(minutes: i64) -> Result<Duration, CredentialError> {
    if !(1..=MAX_TTL_MINUTES).contains(&minutes) {
        return Err(CredentialError::InvalidTtl(minutes));
    }
    Duration::try_minutes(minutes).ok_or(CredentialError::InvalidTtl(minutes))
}

/// Process-wide credential configuration, loaded once at startup.
#[derive(Clone)]
pub struct CredentialConfig {
    pub signing_secret: Vec<u8>,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
    pub password: PasswordParams,
}

impl CredentialConfig {
    pub fn new(signing_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            access_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_ttl_minutes: DEFAULT_REFRESH_TTL_MINUTES,
            password: PasswordParams::default(),
        }
    }

    pub fn with_password_params(mut self, params: PasswordParams) -> Self {
        self.password = params;
        self
    }

    pub fn with_ttls(mut self, access_minutes: i64, refresh_minutes: i64) -> Self {
        self.access_ttl_minutes = access_minutes;
        self.refresh_ttl_minutes = refresh_minutes;
        self
    }
}

impl core::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("signing_secret", &"<redacted>")
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_minutes", &self.refresh_ttl_minutes)
            .field("password", &self.password)
            .finish()
    }
}

/// An access/refresh token pair bound to one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

/// Hashes/verifies passwords and mints/verifies bearer tokens.
///
/// No IO. Password operations are CPU-heavy by construction.
#[derive(Clone)]
pub struct CredentialService {
    hasher: Argon2<'static>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl core::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl CredentialService {
    pub fn new(config: &CredentialConfig) -> Result<Self, CredentialError> {
        if config.signing_secret.is_empty() {
            return Err(CredentialError::EmptySecret);
        }

        Ok(Self {
            hasher: config.password.hasher()?,
            encoding_key: EncodingKey::from_secret(&config.signing_secret),
            decoding_key: DecodingKey::from_secret(&config.signing_secret),
            access_ttl: ttl_from_minutes(config.access_ttl_minutes)?,
            refresh_ttl: ttl_from_minutes(config.refresh_ttl_minutes)?,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn hash_password(&self, password: &str) -> Result<String, CredentialError> {
        password::hash_password(&self.hasher, password)
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        password::verify_password(&self.hasher, password, hash)
    }

    /// Mint a token for `subject` valid for `ttl_minutes` from now.
    pub fn mint(&self, subject: UserId, typ: TokenType, ttl_minutes: i64) -> Result<String, CredentialError> {
        self.mint_at(subject, typ, ttl_from_minutes(ttl_minutes)?, Utc::now())
    }

    pub fn mint_at(
        &self,
        subject: UserId,
        typ: TokenType,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, CredentialError> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(CredentialError::InvalidTtl(ttl.num_minutes()))?;
        let claims = TokenClaims::new(subject, typ, now, expires_at);
        token::encode(&claims, &self.encoding_key).map_err(|e| CredentialError::Signing(e.to_string()))
    }

    /// Mint the access/refresh pair handed out on authentication.
    pub fn issue(&self, subject: UserId) -> Result<TokenPair, CredentialError> {
        let now = Utc::now();
        Ok(TokenPair {
            access_token: self.mint_at(subject, TokenType::Access, self.access_ttl, now)?,
            refresh_token: self.mint_at(subject, TokenType::Refresh, self.refresh_ttl, now)?,
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    pub fn verify_token(&self, token: &str, expected: TokenType) -> Result<TokenClaims, InvalidToken> {
        self.verify_token_at(token, expected, Utc::now())
    }

    pub fn verify_token_at(
        &self,
        token: &str,
        expected: TokenType,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, InvalidToken> {
        token::decode(token, &self.decoding_key, expected, now)
    }
}
