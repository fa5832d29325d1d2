//! Signed bearer tokens (HS256 JWT).
//!
//! Decoding fails closed: every way a token can be unusable maps to an
//! [`InvalidToken`] value. Nothing here panics on attacker-controlled input.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rollcall_core::UserId;

use crate::claims::{TokenClaims, TokenValidationError, validate_claims};

/// Distinguishes access tokens from refresh tokens.
///
/// Refresh tokens are only accepted by the refresh exchange, never as proof
/// of identity on a protected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl core::fmt::Display for TokenType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TokenType::Access => write!(f, "access"),
            TokenType::Refresh => write!(f, "refresh"),
        }
    }
}

/// Why a token could not be turned into an identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidToken {
    #[error("malformed token")]
    Malformed,

    #[error("token signature does not verify")]
    BadSignature,

    #[error("token is missing the `{0}` claim")]
    MissingClaim(&'static str),

    #[error("expected a {expected} token, got a {found} token")]
    WrongType { expected: TokenType, found: TokenType },

    #[error(transparent)]
    Window(#[from] TokenValidationError),
}

/// Claims as they appear on the wire, before presence checks.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    typ: Option<TokenType>,
}

fn validation() -> Validation {
    // Time checks are done by `validate_claims` against an injectable `now`.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    validation
}

/// Sign claims into a compact token.
pub fn encode(claims: &TokenClaims, key: &EncodingKey) -> Result<String, jsonwebtoken::errors::Error> {
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, key)
}

/// Verify signature, claim presence, token type and time window.
pub fn decode(
    token: &str,
    key: &DecodingKey,
    expected: TokenType,
    now: DateTime<Utc>,
) -> Result<TokenClaims, InvalidToken> {
    let data = jsonwebtoken::decode::<RawClaims>(token, key, &validation()).map_err(|e| {
        match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => InvalidToken::BadSignature,
            _ => InvalidToken::Malformed,
        }
    })?;
    let raw = data.claims;

    let sub = raw
        .sub
        .as_deref()
        .and_then(|s| s.parse::<UserId>().ok())
        .ok_or(InvalidToken::MissingClaim("sub"))?;
    let iat = raw.iat.ok_or(InvalidToken::MissingClaim("iat"))?;
    let exp = raw.exp.ok_or(InvalidToken::MissingClaim("exp"))?;
    let typ = raw.typ.ok_or(InvalidToken::MissingClaim("typ"))?;

    if typ != expected {
        return Err(InvalidToken::WrongType { expected, found: typ });
    }

    let claims = TokenClaims { sub, iat, exp, typ };
    validate_claims(&claims, now)?;
    Ok(claims)
}
