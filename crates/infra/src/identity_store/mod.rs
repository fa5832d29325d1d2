//! Identity store: persistence for user records.
//!
//! ## Contract
//!
//! - `username` is unique. `create` reports a duplicate as
//!   [`StoreError::Conflict`], so a check-then-insert race in the caller still
//!   ends in a single record.
//! - Records are immutable once created; there is no update or delete.
//! - Lookups of absent records return `Ok(None)`, never an error.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use rollcall_auth::User;
use rollcall_core::UserId;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryUserStore;
pub use postgres::PostgresUserStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("username already taken: {0}")]
    Conflict(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn retrieve_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn retrieve_one(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Insert a new record. Fails with [`StoreError::Conflict`] if the username is taken.
    async fn create(&self, user: User) -> Result<User, StoreError>;

    /// Every record, oldest first.
    async fn retrieve_all(&self) -> Result<Vec<User>, StoreError>;
}

#[async_trait]
impl<S> UserStore for Arc<S>
where
    S: UserStore + ?Sized,
{
    async fn retrieve_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        (**self).retrieve_by_username(username).await
    }

    async fn retrieve_one(&self, id: UserId) -> Result<Option<User>, StoreError> {
        (**self).retrieve_one(id).await
    }

    async fn create(&self, user: User) -> Result<User, StoreError> {
        (**self).create(user).await
    }

    async fn retrieve_all(&self) -> Result<Vec<User>, StoreError> {
        (**self).retrieve_all().await
    }
}
