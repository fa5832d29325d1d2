//! Application context: owns the identity store, the broker and the task
//! consumer for the lifetime of the process.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;

use rollcall_auth::CredentialService;
use rollcall_events::{Broker, InMemoryBroker};
use rollcall_infra::{
    HandlerRegistry, InMemoryUserStore, PostgresUserStore, RetryPolicy, TaskConsumer, TaskConsumerConfig,
    TaskConsumerHandle, TaskDispatcher, UserService, UserStore, register_user_handlers,
};

#[cfg(feature = "redis")]
use rollcall_infra::broker::RedisStreamsBroker;

use crate::config::AppConfig;

const POSTGRES_MAX_CONNECTIONS: u32 = 10;

#[cfg(feature = "redis")]
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

pub struct AppServices {
    pub users: UserService,
    broker: Arc<dyn Broker>,
    postgres: Option<PostgresUserStore>,
    consumer: Mutex<Option<TaskConsumerHandle>>,
    schedule_delay: chrono::Duration,
}

impl AppServices {
    /// Connect stores and broker, then start the task consumer.
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let credentials =
            CredentialService::new(&config.credential_config()).context("invalid credential configuration")?;

        let (store, postgres) = build_store(config).await?;
        let broker = build_broker(config).await?;

        let users = UserService::new(store, credentials, TaskDispatcher::new(broker.clone()));

        let mut registry = HandlerRegistry::new();
        register_user_handlers(&mut registry, users.clone());
        let exchanges = registry.exchanges();

        let consumer_config = TaskConsumerConfig::default()
            .with_name("user-tasks")
            .with_max_concurrent(config.consumer_concurrency)
            .with_retry(RetryPolicy::default().with_max_retries(config.task_max_retries));

        let consumer = TaskConsumer::new(broker.clone(), registry, consumer_config)
            .spawn(exchanges)
            .await
            .context("failed to start task consumer")?;

        tracing::info!(
            persistent = postgres.is_some(),
            concurrency = config.consumer_concurrency,
            "application services ready"
        );

        Ok(Self {
            users,
            broker,
            postgres,
            consumer: Mutex::new(Some(consumer)),
            schedule_delay: config.schedule_delay(),
        })
    }

    pub fn schedule_delay(&self) -> chrono::Duration {
        self.schedule_delay
    }

    /// Stop the consumer, then release the broker and the database pool.
    ///
    /// Idempotent; later calls only re-close the broker.
    pub async fn shutdown(&self) {
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }

        if let Err(e) = self.broker.close().await {
            tracing::warn!(error = %e, "broker close failed");
        }

        if let Some(postgres) = &self.postgres {
            postgres.close().await;
        }

        tracing::info!("application services stopped");
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<(Arc<dyn UserStore>, Option<PostgresUserStore>)> {
    if !config.use_persistent_stores {
        let store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        return Ok((store, None));
    }

    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let postgres = PostgresUserStore::connect(url, POSTGRES_MAX_CONNECTIONS)
        .await
        .context("failed to connect to Postgres")?;
    postgres.ensure_schema().await.context("failed to prepare users table")?;

    let store: Arc<dyn UserStore> = Arc::new(postgres.clone());
    Ok((store, Some(postgres)))
}

#[cfg(feature = "redis")]
async fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if !config.use_persistent_stores && config.redis_url.is_none() {
        let broker: Arc<dyn Broker> = InMemoryBroker::arc();
        return Ok(broker);
    }

    let url = config.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL);
    let broker = RedisStreamsBroker::connect(url, None)
        .await
        .context("failed to connect to Redis")?
        .with_consumer_name(config.redis_consumer_name.clone());
    let broker: Arc<dyn Broker> = Arc::new(broker);
    Ok(broker)
}

#[cfg(not(feature = "redis"))]
async fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if config.use_persistent_stores || config.redis_url.is_some() {
        tracing::warn!("durable broker requested but redis feature not enabled, falling back to in-memory");
    }
    let broker: Arc<dyn Broker> = InMemoryBroker::arc();
    Ok(broker)
}
