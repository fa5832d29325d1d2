//! Task consumer: routes deliveries to handlers with retry and dead-lettering.
//!
//! ## Lifecycle of one delivery
//!
//! ```text
//! Received ─┬─ not due ─→ Scheduled ─→ Executing
//!           └─ due ─────────────────→ Executing ─┬─ Ok ─────────────→ Acknowledged
//!                                                ├─ transient, left → retry copy published, original acked
//!                                                └─ otherwise ──────→ Dead-lettered
//! ```
//!
//! - Routing is by `(exchange, kind)`. An unknown pair is never executed by
//!   another handler and never dropped: it is dead-lettered and reported as
//!   [`TaskError::UnroutableTask`].
//! - Every delivery runs on its own tokio task, bounded by `max_concurrent`.
//!   A failing (or panicking) handler never stops the consume loop.
//! - Not-yet-due deliveries stay unacked while the [`Scheduler`] holds them,
//!   so a durable broker redelivers them after a crash.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rollcall_core::TaskId;
use rollcall_events::{Broker, BrokerError, Delivery, Exchange, RouteKey, TaskEnvelope, TaskKind};

use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;

/// Dead-letter reason recorded for cancelled scheduled tasks.
pub const CANCELLED_REASON: &str = "cancelled";

/// How a handler failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// May succeed if tried again later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Will fail the same way every time.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no handler registered for {exchange}/{kind}")]
    UnroutableTask { exchange: Exchange, kind: TaskKind },

    #[error("task {task_id} ({route}) failed on attempt {attempt}: {reason}")]
    HandlerFailure {
        task_id: TaskId,
        route: RouteKey,
        attempt: u32,
        reason: String,
    },

    #[error("consumer is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// How a delivery was settled when processing did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler succeeded, delivery acked.
    Completed,
    /// Transient failure, a delayed copy was published for `attempt`.
    Retried { attempt: u32, at: DateTime<Utc> },
    /// Not yet due, held by the scheduler until `at`.
    Scheduled { at: DateTime<Utc> },
}

/// Handler for one `(exchange, kind)` route.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), HandlerError> {
        (self.0)(envelope).await
    }
}

/// Route table from `(exchange, kind)` to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RouteKey, Arc<dyn TaskHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a route.
    pub fn register(&mut self, route: RouteKey, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(route, handler);
        self
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        exchange: impl Into<Exchange>,
        kind: impl Into<TaskKind>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(RouteKey::new(exchange, kind), Arc::new(FnHandler(handler)))
    }

    pub fn resolve(&self, route: &RouteKey) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(route).cloned()
    }

    /// Distinct exchanges with at least one route, sorted.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.handlers
            .keys()
            .map(|r| r.exchange.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Task consumer configuration.
#[derive(Debug, Clone)]
pub struct TaskConsumerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum deliveries executing at once
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for TaskConsumerConfig {
    fn default() -> Self {
        Self {
            name: "task-consumer".to_string(),
            max_concurrent: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl TaskConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub unroutable: u64,
    pub scheduled: u64,
    pub cancelled: u64,
    /// Deliveries left neither acked nor dead-lettered because the broker failed.
    pub unsettled: u64,
}

struct Inner {
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    config: TaskConsumerConfig,
    scheduler: Scheduler,
    permits: Semaphore,
    stats: Mutex<ConsumerStats>,
}

/// Consumes task deliveries from a broker. Cheap to clone.
#[derive(Clone)]
pub struct TaskConsumer {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for TaskConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskConsumer")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl TaskConsumer {
    pub fn new(broker: Arc<dyn Broker>, registry: HandlerRegistry, config: TaskConsumerConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(Inner {
                broker,
                registry,
                config,
                scheduler: Scheduler::new(),
                permits,
                stats: Mutex::new(ConsumerStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Cancel a task held by the scheduler; it is dead-lettered as `cancelled`.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.inner.scheduler.cancel(task_id)
    }

    fn record(&self, update: impl FnOnce(&mut ConsumerStats)) {
        update(&mut self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Take one delivery through the full lifecycle.
    ///
    /// Returns once the delivery is settled, or once it is handed to the
    /// scheduler if it is not due yet.
    pub async fn process(&self, delivery: Delivery) -> Result<TaskOutcome, TaskError> {
        self.record(|s| s.received += 1);

        let envelope = delivery.envelope();
        if let (Some(delay), Some(at)) = (envelope.remaining_delay(Utc::now()), envelope.execute_at()) {
            debug!(
                consumer = %self.inner.config.name,
                task_id = %envelope.task_id(),
                execute_at = %at,
                "task not due yet, holding"
            );
            self.record(|s| s.scheduled += 1);

            let task_id = envelope.task_id();
            let due = (self.clone(), delivery.clone());
            let cancelled = (self.clone(), delivery);
            self.inner.scheduler.schedule(
                task_id,
                delay,
                async move {
                    let (consumer, delivery) = due;
                    consumer.execute_logged(delivery).await;
                },
                async move {
                    let (consumer, delivery) = cancelled;
                    consumer.settle_cancelled(delivery).await;
                },
            );
            return Ok(TaskOutcome::Scheduled { at });
        }

        self.execute(delivery).await
    }

    /// Route and run a due delivery, then settle it.
    pub async fn execute(&self, delivery: Delivery) -> Result<TaskOutcome, TaskError> {
        let envelope = delivery.envelope().clone();
        let route = envelope.route_key();

        let Some(handler) = self.inner.registry.resolve(&route) else {
            warn!(
                consumer = %self.inner.config.name,
                task_id = %envelope.task_id(),
                route = %route,
                "no handler for task, dead-lettering"
            );
            self.record(|s| s.unroutable += 1);
            self.dead_letter(&delivery, &format!("unroutable task: {route}")).await?;
            return Err(TaskError::UnroutableTask {
                exchange: route.exchange,
                kind: route.kind,
            });
        };

        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| TaskError::ShuttingDown)?;

        // Run on a separate task so a panic surfaces as a JoinError.
        let result = tokio::spawn(async move { handler.handle(envelope).await }).await;

        let failure = match result {
            Ok(Ok(())) => {
                if let Err(e) = self.inner.broker.ack(&delivery).await {
                    return Err(self.fall_back_to_dead_letter(&delivery, &route, e, "ack after completion failed").await);
                }
                self.record(|s| s.succeeded += 1);
                debug!(task_id = %delivery.envelope().task_id(), route = %route, "task completed");
                return Ok(TaskOutcome::Completed);
            }
            Ok(Err(failure)) => failure,
            Err(join) if join.is_panic() => HandlerError::transient("handler panicked"),
            Err(_) => HandlerError::transient("handler task was cancelled"),
        };

        self.settle_failure(delivery, route, failure).await
    }

    async fn settle_failure(
        &self,
        delivery: Delivery,
        route: RouteKey,
        failure: HandlerError,
    ) -> Result<TaskOutcome, TaskError> {
        let envelope = delivery.envelope();
        let task_id = envelope.task_id();
        let attempt = envelope.attempt();
        let retry = &self.inner.config.retry;

        let reason = match failure {
            HandlerError::Transient(reason) if retry.should_retry(attempt) => {
                let delay = retry.delay_for_retry(attempt + 1);
                let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

                if let Err(e) = self.inner.broker.publish(envelope.clone().into_retry(at)).await {
                    return Err(self.fall_back_to_dead_letter(&delivery, &route, e, "retry publish failed").await);
                }
                if let Err(e) = self.inner.broker.ack(&delivery).await {
                    return Err(self.fall_back_to_dead_letter(&delivery, &route, e, "ack after retry publish failed").await);
                }
                self.record(|s| s.retried += 1);

                warn!(
                    task_id = %task_id,
                    route = %route,
                    attempt = attempt,
                    retry_at = %at,
                    error = %reason,
                    "task failed, retry scheduled"
                );
                return Ok(TaskOutcome::Retried { attempt: attempt + 1, at });
            }
            HandlerError::Transient(reason) => {
                format!("retries exhausted after {} attempts: {reason}", attempt + 1)
            }
            HandlerError::Permanent(reason) => format!("permanent failure: {reason}"),
        };

        self.dead_letter(&delivery, &reason).await?;
        error!(task_id = %task_id, route = %route, attempt = attempt, reason = %reason, "task dead-lettered");

        Err(TaskError::HandlerFailure {
            task_id,
            route,
            attempt,
            reason,
        })
    }

    /// Dead-letter `delivery`. On broker failure the delivery stays unsettled;
    /// that is logged and counted.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TaskError> {
        match self.inner.broker.dead_letter(delivery, reason).await {
            Ok(()) => {
                self.record(|s| s.dead_lettered += 1);
                Ok(())
            }
            Err(e) => {
                error!(
                    consumer = %self.inner.config.name,
                    task_id = %delivery.envelope().task_id(),
                    reason = %reason,
                    error = %e,
                    "failed to dead-letter task, delivery left unsettled"
                );
                self.record(|s| s.unsettled += 1);
                Err(TaskError::Broker(e))
            }
        }
    }

    /// A settle step (ack or retry publish) failed: dead-letter instead.
    async fn fall_back_to_dead_letter(
        &self,
        delivery: &Delivery,
        route: &RouteKey,
        cause: BrokerError,
        step: &str,
    ) -> TaskError {
        warn!(
            task_id = %delivery.envelope().task_id(),
            route = %route,
            error = %cause,
            "{step}, dead-lettering"
        );
        let _ = self.dead_letter(delivery, &format!("{step}: {cause}")).await;
        TaskError::Broker(cause)
    }

    fn log_unfinished(&self, task_id: TaskId, err: &TaskError) {
        match err {
            TaskError::Broker(e) => {
                warn!(consumer = %self.inner.config.name, task_id = %task_id, error = %e, "task not settled")
            }
            other => debug!(consumer = %self.inner.config.name, task_id = %task_id, error = %other, "task not completed"),
        }
    }

    async fn execute_logged(&self, delivery: Delivery) {
        let task_id = delivery.envelope().task_id();
        if let Err(e) = self.execute(delivery).await {
            self.log_unfinished(task_id, &e);
        }
    }

    async fn process_logged(&self, delivery: Delivery) {
        let task_id = delivery.envelope().task_id();
        if let Err(e) = self.process(delivery).await {
            self.log_unfinished(task_id, &e);
        }
    }

    async fn settle_cancelled(&self, delivery: Delivery) {
        if self.dead_letter(&delivery, CANCELLED_REASON).await.is_ok() {
            self.record(|s| s.cancelled += 1);
            info!(task_id = %delivery.envelope().task_id(), "scheduled task cancelled");
        }
    }

    /// Subscribe to `exchanges` and consume in the background.
    pub async fn spawn(self, exchanges: Vec<Exchange>) -> Result<TaskConsumerHandle, TaskError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::with_capacity(exchanges.len());

        for exchange in exchanges {
            let subscription = self.inner.broker.consume(&exchange).await?;
            let consumer = self.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            loops.push(tokio::spawn(async move {
                info!(consumer = %consumer.inner.config.name, exchange = %exchange, "task consumer started");
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        delivery = subscription.recv() => match delivery {
                            Some(delivery) => {
                                let consumer = consumer.clone();
                                tokio::spawn(async move { consumer.process_logged(delivery).await });
                            }
                            None => break,
                        },
                    }
                }
                info!(consumer = %consumer.inner.config.name, exchange = %exchange, "task consumer stopped");
            }));
        }

        Ok(TaskConsumerHandle {
            consumer: self,
            shutdown,
            loops,
        })
    }
}

/// Handle to control a running consumer.
#[derive(Debug)]
pub struct TaskConsumerHandle {
    consumer: TaskConsumer,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl TaskConsumerHandle {
    pub fn consumer(&self) -> &TaskConsumer {
        &self.consumer
    }

    pub fn stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    /// Stop consuming, release held tasks (left unacked for redelivery) and
    /// wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.loops {
            let _ = join.await;
        }

        let abandoned = self.consumer.inner.scheduler.abandon_all();
        let max = self.consumer.inner.config.max_concurrent.max(1) as u32;
        if let Ok(permits) = self.consumer.inner.permits.acquire_many(max).await {
            permits.forget();
        }
        self.consumer.inner.permits.close();

        info!(
            consumer = %self.consumer.inner.config.name,
            abandoned = abandoned,
            "task consumer shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use rollcall_events::InMemoryBroker;
    use serde_json::json;

    async fn deliver(broker: &InMemoryBroker, envelope: TaskEnvelope) -> Delivery {
        let exchange = envelope.exchange().clone();
        broker.publish(envelope).await.unwrap();
        broker.consume(&exchange).await.unwrap().try_recv().unwrap()
    }

    fn consumer(broker: Arc<InMemoryBroker>, registry: HandlerRegistry) -> TaskConsumer {
        let retry = RetryPolicy::exponential(2, Duration::from_millis(10), Duration::from_millis(50));
        TaskConsumer::new(broker, registry, TaskConsumerConfig::default().with_retry(retry))
    }

    #[tokio::test]
    async fn success_is_acked() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Ok(()) });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("user", "create", json!({}))).await;
        assert_eq!(consumer.process(delivery).await.unwrap(), TaskOutcome::Completed);

        assert_eq!(broker.unacked_count(), 0);
        let stats = consumer.stats();
        assert_eq!((stats.received, stats.succeeded), (1, 1));
    }

    #[tokio::test]
    async fn unroutable_is_dead_lettered_not_dropped() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Ok(()) });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("user", "delete", json!({}))).await;
        let err = consumer.process(delivery).await.unwrap_err();

        assert!(matches!(
            err,
            TaskError::UnroutableTask { ref exchange, ref kind }
                if exchange.as_str() == "user" && kind.as_str() == "delete"
        ));
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(consumer.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn same_kind_on_other_exchange_is_unroutable() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Ok(()) });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("billing", "create", json!({}))).await;
        assert!(matches!(
            consumer.process(delivery).await,
            Err(TaskError::UnroutableTask { .. })
        ));
    }

    #[tokio::test]
    async fn transient_failure_publishes_delayed_retry() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Err(HandlerError::transient("db down")) });
        let consumer = consumer(broker.clone(), registry);

        let envelope = TaskEnvelope::new("user", "create", json!({}));
        let task_id = envelope.task_id();
        let delivery = deliver(&broker, envelope).await;

        let outcome = consumer.process(delivery).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Retried { attempt: 1, .. }));

        // Original acked, retry copy waiting in the queue.
        assert_eq!(broker.unacked_count(), 1);
        let retry = broker.consume(&Exchange::new("user")).await.unwrap().try_recv().unwrap();
        assert_eq!(retry.envelope().task_id(), task_id);
        assert_eq!(retry.envelope().attempt(), 1);
        assert!(retry.envelope().execute_at().is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Err(HandlerError::transient("db down")) });
        let consumer = consumer(broker.clone(), registry);

        let mut envelope = TaskEnvelope::new("user", "create", json!({}));
        for _ in 0..2 {
            envelope = envelope.into_retry(Utc::now());
        }
        let delivery = deliver(&broker, envelope).await;

        let err = consumer.execute(delivery).await.unwrap_err();
        assert!(matches!(err, TaskError::HandlerFailure { attempt: 2, .. }));
        assert_eq!(broker.dead_letters().len(), 1);
        assert!(broker.dead_letters()[0].reason.starts_with("retries exhausted"));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Err(HandlerError::permanent("bad payload")) });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("user", "create", json!({}))).await;
        assert!(matches!(
            consumer.process(delivery).await,
            Err(TaskError::HandlerFailure { attempt: 0, .. })
        ));
        assert_eq!(consumer.stats().retried, 0);
        assert_eq!(broker.dead_letters()[0].reason, "permanent failure: bad payload");
    }

    #[tokio::test]
    async fn panicking_handler_is_transient() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("user", "create", json!({}))).await;
        assert!(matches!(
            consumer.process(delivery).await,
            Ok(TaskOutcome::Retried { attempt: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_is_held_then_executed() {
        let broker = InMemoryBroker::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = runs.clone();
        registry.register_fn("user", "create", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let consumer = consumer(broker.clone(), registry);

        let at = Utc::now() + chrono::Duration::minutes(5);
        let delivery = deliver(&broker, TaskEnvelope::new("user", "create", json!({})).with_schedule(Some(at))).await;
        assert_eq!(consumer.process(delivery).await.unwrap(), TaskOutcome::Scheduled { at });
        assert_eq!(broker.unacked_count(), 1);

        tokio::time::sleep(Duration::from_secs(290)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_is_dead_lettered() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Ok(()) });
        let consumer = consumer(broker.clone(), registry);

        let envelope = TaskEnvelope::new("user", "create", json!({}))
            .with_schedule(Some(Utc::now() + chrono::Duration::hours(1)));
        let task_id = envelope.task_id();
        let delivery = deliver(&broker, envelope).await;
        consumer.process(delivery).await.unwrap();

        assert!(consumer.cancel(task_id));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(broker.dead_letters()[0].reason, CANCELLED_REASON);
        assert_eq!(consumer.stats().cancelled, 1);
        assert_eq!(consumer.stats().succeeded, 0);
    }

    #[tokio::test]
    async fn spawned_consumer_keeps_going_after_failures() {
        let broker = InMemoryBroker::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = runs.clone();
        registry.register_fn("user", "create", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let handle = consumer(broker.clone(), registry)
            .spawn(vec![Exchange::new("user")])
            .await
            .unwrap();

        broker.publish(TaskEnvelope::new("user", "unknown", json!({}))).await.unwrap();
        broker.publish(TaskEnvelope::new("user", "create", json!({}))).await.unwrap();

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) == 1 && handle.stats().unroutable == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().unroutable, 1);

        handle.shutdown().await;
    }

    #[test]
    fn registry_lists_distinct_exchanges() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("user", "create", |_| async { Ok(()) })
            .register_fn("user", "delete", |_| async { Ok(()) })
            .register_fn("billing", "charge", |_| async { Ok(()) });

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.exchanges(), vec![Exchange::new("billing"), Exchange::new("user")]);
    }

    #[tokio::test]
    async fn failed_retry_publish_falls_back_to_dead_letter() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Err(HandlerError::transient("db down")) });
        let consumer = consumer(broker.clone(), registry);

        let delivery = deliver(&broker, TaskEnvelope::new("user", "create", json!({}))).await;
        broker.close().await.unwrap();

        let err = consumer.execute(delivery).await.unwrap_err();

        assert!(matches!(err, TaskError::Broker(BrokerError::Closed)));
        assert_eq!(broker.unacked_count(), 0);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.starts_with("retry publish failed"));
        let stats = consumer.stats();
        assert_eq!((stats.retried, stats.dead_lettered, stats.unsettled), (0, 1, 0));
    }

    #[tokio::test]
    async fn unsettleable_delivery_is_counted() {
        let broker = InMemoryBroker::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("user", "create", |_| async { Ok(()) });
        let consumer = consumer(broker.clone(), registry);

        // Never handed out by this broker, so both ack and dead-letter fail.
        let stray = Delivery::new(
            rollcall_events::DeliveryTag::new("stray"),
            TaskEnvelope::new("user", "create", json!({})),
        );

        let err = consumer.execute(stray).await.unwrap_err();

        assert!(matches!(err, TaskError::Broker(BrokerError::UnknownDelivery(_))));
        assert!(broker.dead_letters().is_empty());
        let stats = consumer.stats();
        assert_eq!((stats.succeeded, stats.dead_lettered, stats.unsettled), (0, 0, 1));
    }
}
