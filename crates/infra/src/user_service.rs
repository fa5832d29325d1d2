//! User service: account creation, authentication and token-based identity.
//!
//! Orchestrates the identity store, the credential service and the task
//! dispatcher. Password hashing and verification are CPU-heavy and run on the
//! blocking pool so they never stall the async workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use rollcall_auth::{CredentialError, CredentialService, InvalidToken, NewUser, TokenPair, TokenType, User};
use rollcall_core::{DomainError, TaskId};

use crate::identity_store::{StoreError, UserStore};
use crate::task_dispatcher::{DispatchError, TaskDispatcher};
use crate::user_tasks::{CREATE_TASK, USER_EXCHANGE};

#[derive(Debug, Error)]
pub enum UserError {
    #[error("invalid user input: {0}")]
    Validation(String),

    #[error("username already exists: {0}")]
    AlreadyExists(String),

    #[error("user not found")]
    NotFound,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] InvalidToken),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<DomainError> for UserError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => UserError::Validation(msg),
            other @ DomainError::InvalidId(_) => UserError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for UserError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(name) => UserError::AlreadyExists(name),
            other => UserError::Store(other),
        }
    }
}

/// Credential pair returned by authentication and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuth {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

impl From<TokenPair> for UserAuth {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "bearer".to_string(),
            expires_in: pair.expires_in,
        }
    }
}

/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
    credentials: CredentialService,
    dispatcher: TaskDispatcher,
}

impl core::fmt::Debug for UserService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UserService")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>, credentials: CredentialService, dispatcher: TaskDispatcher) -> Self {
        Self {
            store,
            credentials,
            dispatcher,
        }
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    /// Create an account right away.
    #[instrument(skip(self, new_user), fields(username = %new_user.username), err)]
    pub async fn create(&self, new_user: NewUser) -> Result<User, UserError> {
        new_user.validate()?;

        if self.store.retrieve_by_username(&new_user.username).await?.is_some() {
            return Err(UserError::AlreadyExists(new_user.username));
        }

        let credentials = self.credentials.clone();
        let password = new_user.password;
        let password_hash = tokio::task::spawn_blocking(move || credentials.hash_password(&password))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))??;

        // The store re-checks uniqueness, so a concurrent create still loses here.
        let user = self.store.create(User::new(new_user.username, password_hash)).await?;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// Exchange username and password for an access/refresh pair.
    #[instrument(skip(self, password), err)]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserAuth, UserError> {
        let user = self
            .store
            .retrieve_by_username(username)
            .await?
            .ok_or(UserError::NotFound)?;

        let credentials = self.credentials.clone();
        let password = password.to_string();
        let hash = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || credentials.verify_password(&password, &hash))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;

        if !verified {
            return Err(UserError::InvalidCredentials);
        }

        Ok(self.credentials.issue(user.id)?.into())
    }

    /// Trade a refresh token for a fresh pair. Access tokens are rejected.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<UserAuth, UserError> {
        let claims = self.credentials.verify_token(refresh_token, TokenType::Refresh)?;
        let user = self
            .store
            .retrieve_one(claims.sub)
            .await?
            .ok_or(UserError::InvalidToken(InvalidToken::MissingClaim("sub")))?;

        Ok(self.credentials.issue(user.id)?.into())
    }

    /// Resolve an access token to its user.
    ///
    /// Total: every failure (bad token, refresh token, unknown subject, store
    /// error) is `None`.
    #[instrument(skip_all)]
    pub async fn retrieve_by_token(&self, token: &str) -> Option<User> {
        let claims = match self.credentials.verify_token(token, TokenType::Access) {
            Ok(claims) => claims,
            Err(reason) => {
                debug!(reason = %reason, "token rejected");
                return None;
            }
        };

        match self.store.retrieve_one(claims.sub).await {
            Ok(user) => user,
            Err(e) => {
                warn!(user_id = %claims.sub, error = %e, "identity lookup failed");
                None
            }
        }
    }

    pub async fn retrieve_by_username(&self, username: &str) -> Result<Option<User>, UserError> {
        Ok(self.store.retrieve_by_username(username).await?)
    }

    pub async fn retrieve_all(&self) -> Result<Vec<User>, UserError> {
        Ok(self.store.retrieve_all().await?)
    }

    /// Defer account creation to a `user/create` task.
    ///
    /// Input is validated now; uniqueness is checked when the task runs.
    #[instrument(skip(self, new_user), fields(username = %new_user.username), err)]
    pub async fn create_later(&self, new_user: NewUser, when: Option<DateTime<Utc>>) -> Result<TaskId, UserError> {
        new_user.validate()?;

        let task_id = self
            .dispatcher
            .enqueue(&new_user, CREATE_TASK.into(), USER_EXCHANGE.into(), when)
            .await?;
        info!(task_id = %task_id, "user creation enqueued");
        Ok(task_id)
    }
}
