//! Integration tests for the deferred user-creation pipeline.
//!
//! Tests: UserService → TaskDispatcher → Broker → TaskConsumer → CreateUserHandler → UserStore
//!
//! Verifies:
//! - Immediate tasks are consumed and create the user
//! - Delayed tasks do not run before their execution time
//! - Unroutable tasks are dead-lettered while the consumer keeps going
//! - Duplicate deferred creates end in one record and one dead letter

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use serde_json::json;

    use rollcall_auth::{CredentialConfig, CredentialService, NewUser, PasswordParams};
    use rollcall_events::{Broker, Exchange, InMemoryBroker, TaskEnvelope};

    use crate::identity_store::InMemoryUserStore;
    use crate::retry::RetryPolicy;
    use crate::task_consumer::{HandlerRegistry, TaskConsumer, TaskConsumerConfig, TaskConsumerHandle};
    use crate::task_dispatcher::TaskDispatcher;
    use crate::user_service::UserService;
    use crate::user_tasks::{USER_EXCHANGE, register_user_handlers};

    async fn setup() -> (UserService, Arc<InMemoryBroker>, TaskConsumerHandle) {
        let broker = InMemoryBroker::arc();
        let config = CredentialConfig::new("pipeline-secret").with_password_params(PasswordParams::insecure_fast());
        let users = UserService::new(
            Arc::new(InMemoryUserStore::new()),
            CredentialService::new(&config).unwrap(),
            TaskDispatcher::new(broker.clone()),
        );

        let mut registry = HandlerRegistry::new();
        register_user_handlers(&mut registry, users.clone());
        let consumer_config = TaskConsumerConfig::default()
            .with_name("pipeline-test")
            .with_retry(RetryPolicy::fixed(1, Duration::from_millis(10)));

        let handle = TaskConsumer::new(broker.clone(), registry, consumer_config)
            .spawn(vec![Exchange::new(USER_EXCHANGE)])
            .await
            .unwrap();

        (users, broker, handle)
    }

    /// Poll until `username` exists. Uses wall-clock time so it also works
    /// under a paused tokio clock while hashing runs on the blocking pool.
    async fn wait_for_user(users: &UserService, username: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if users.retrieve_by_username(username).await.unwrap().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn immediate_task_creates_bob() {
        let (users, broker, handle) = setup().await;

        users.create_later(NewUser::new("bob", "hunter2"), None).await.unwrap();

        assert!(wait_for_user(&users, "bob").await);
        let auth = users.authenticate("bob", "hunter2").await.unwrap();
        assert_eq!(
            users.retrieve_by_token(&auth.access_token).await.map(|u| u.username),
            Some("bob".to_string())
        );
        assert!(broker.dead_letters().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_five_minutes() {
        let (users, broker, handle) = setup().await;
        let when = Utc::now() + chrono::Duration::minutes(5);

        users.create_later(NewUser::new("carol", "pw"), Some(when)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(295)).await;
        assert_eq!(users.retrieve_by_username("carol").await.unwrap(), None);
        assert_eq!(handle.stats().scheduled, 1);
        assert_eq!(broker.unacked_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(wait_for_user(&users, "carol").await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unroutable_task_does_not_stop_the_consumer() {
        let (users, broker, handle) = setup().await;

        broker
            .publish(TaskEnvelope::new(USER_EXCHANGE, "promote", json!({"username": "eve"})))
            .await
            .unwrap();
        users.create_later(NewUser::new("dave", "pw"), None).await.unwrap();

        assert!(wait_for_user(&users, "dave").await);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.kind().as_str(), "promote");
        assert_eq!(handle.stats().unroutable, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_deferred_create_is_dead_lettered() {
        let (users, broker, handle) = setup().await;

        users.create_later(NewUser::new("frank", "pw1"), None).await.unwrap();
        assert!(wait_for_user(&users, "frank").await);
        users.create_later(NewUser::new("frank", "pw2"), None).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while broker.dead_letters().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(users.retrieve_all().await.unwrap().len(), 1);
        assert!(broker.dead_letters()[0].reason.starts_with("permanent failure"));
        assert!(users.authenticate("frank", "pw1").await.is_ok());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_held_tasks_unacked() {
        let (users, broker, handle) = setup().await;

        users
            .create_later(NewUser::new("grace", "pw"), Some(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.stats().scheduled, 1);

        handle.shutdown().await;

        assert_eq!(broker.unacked_count(), 1);
        assert!(broker.dead_letters().is_empty());
        assert_eq!(users.retrieve_by_username("grace").await.unwrap(), None);
    }
}
