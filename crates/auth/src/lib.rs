//! `rollcall-auth`: credential lifecycle boundary.
//!
//! Password hashing, bearer token minting/verification and the identity record
//! those credentials are bound to. This crate is decoupled from HTTP, storage
//! and the async runtime: every operation is CPU-only.

pub mod claims;
pub mod credentials;
pub mod password;
pub mod token;
pub mod user;

pub use claims::{TokenClaims, TokenValidationError, validate_claims};
pub use credentials::{CredentialConfig, CredentialError, CredentialService, TokenPair};
pub use password::PasswordParams;
pub use token::{InvalidToken, TokenType};
pub use user::{NewUser, User, UserProfile};
