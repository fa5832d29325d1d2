//! Task handlers for the `user` exchange.

use async_trait::async_trait;
use tracing::info;

use rollcall_auth::NewUser;
use rollcall_core::TaskId;
use rollcall_events::{RouteKey, TaskEnvelope};

use crate::task_consumer::{HandlerError, HandlerRegistry, TaskHandler};
use crate::user_service::{UserError, UserService};

pub const USER_EXCHANGE: &str = "user";
pub const CREATE_TASK: &str = "create";

/// Runs deferred account creation (`user/create`).
#[derive(Debug, Clone)]
pub struct CreateUserHandler {
    users: UserService,
}

impl CreateUserHandler {
    pub fn new(users: UserService) -> Self {
        Self { users }
    }
}

#[async_trait]
impl TaskHandler for CreateUserHandler {
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), HandlerError> {
        let task_id = envelope.task_id();
        let new_user: NewUser = serde_json::from_value(envelope.into_payload())
            .map_err(|e| HandlerError::permanent(format!("malformed create payload: {e}")))?;

        match self.users.create(new_user.clone()).await {
            Ok(user) => {
                info!(task_id = %task_id, user_id = %user.id, "deferred user creation done");
                Ok(())
            }
            Err(UserError::AlreadyExists(name)) => self.settle_existing(task_id, &new_user, name).await,
            Err(e) => Err(classify(e)),
        }
    }
}

impl CreateUserHandler {
    /// A redelivered task finds its own earlier insert: the stored record
    /// accepts the payload's password. Anything else is a real duplicate.
    async fn settle_existing(&self, task_id: TaskId, new_user: &NewUser, name: String) -> Result<(), HandlerError> {
        match self.users.authenticate(&new_user.username, &new_user.password).await {
            Ok(_) => {
                info!(task_id = %task_id, username = %name, "user already created by an earlier delivery");
                Ok(())
            }
            Err(UserError::InvalidCredentials | UserError::NotFound) => {
                Err(HandlerError::permanent(UserError::AlreadyExists(name).to_string()))
            }
            Err(e) => Err(classify(e)),
        }
    }
}

fn classify(err: UserError) -> HandlerError {
    match err {
        UserError::Store(_) | UserError::Credential(_) => HandlerError::transient(err.to_string()),
        other => HandlerError::permanent(other.to_string()),
    }
}

/// Register every `user/*` route.
pub fn register_user_handlers(registry: &mut HandlerRegistry, users: UserService) {
    registry.register(
        RouteKey::new(USER_EXCHANGE, CREATE_TASK),
        std::sync::Arc::new(CreateUserHandler::new(users)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rollcall_auth::{CredentialConfig, CredentialService, PasswordParams};
    use serde_json::json;

    use crate::identity_store::InMemoryUserStore;
    use crate::task_dispatcher::TaskDispatcher;
    use rollcall_events::InMemoryBroker;

    fn handler() -> (CreateUserHandler, UserService) {
        let config = CredentialConfig::new("tasks-secret").with_password_params(PasswordParams::insecure_fast());
        let users = UserService::new(
            Arc::new(InMemoryUserStore::new()),
            CredentialService::new(&config).unwrap(),
            TaskDispatcher::new(InMemoryBroker::arc()),
        );
        (CreateUserHandler::new(users.clone()), users)
    }

    #[tokio::test]
    async fn creates_the_user() {
        let (handler, users) = handler();
        let envelope = TaskEnvelope::new(USER_EXCHANGE, CREATE_TASK, json!({"username": "bob", "password": "pw"}));

        handler.handle(envelope).await.unwrap();
        assert!(users.retrieve_by_username("bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let (handler, _) = handler();
        let envelope = TaskEnvelope::new(USER_EXCHANGE, CREATE_TASK, json!({"name": "bob"}));

        assert!(matches!(handler.handle(envelope).await, Err(HandlerError::Permanent(_))));
    }

    #[tokio::test]
    async fn duplicate_username_is_permanent() {
        let (handler, _) = handler();

        handler
            .handle(TaskEnvelope::new(USER_EXCHANGE, CREATE_TASK, json!({"username": "bob", "password": "pw1"})))
            .await
            .unwrap();
        assert!(matches!(
            handler
                .handle(TaskEnvelope::new(USER_EXCHANGE, CREATE_TASK, json!({"username": "bob", "password": "pw2"})))
                .await,
            Err(HandlerError::Permanent(reason)) if reason.contains("already exists")
        ));
    }

    #[tokio::test]
    async fn redelivered_create_is_idempotent() {
        let (handler, users) = handler();
        let envelope = TaskEnvelope::new(USER_EXCHANGE, CREATE_TASK, json!({"username": "bob", "password": "pw"}));

        handler.handle(envelope.clone()).await.unwrap();
        handler.handle(envelope).await.unwrap();

        assert_eq!(users.retrieve_all().await.unwrap().len(), 1);
    }

    #[test]
    fn registers_user_create_route() {
        let (_, users) = handler();
        let mut registry = HandlerRegistry::new();
        register_user_handlers(&mut registry, users);

        assert!(registry.resolve(&RouteKey::new("user", "create")).is_some());
        assert!(registry.resolve(&RouteKey::new("user", "delete")).is_none());
    }
}
