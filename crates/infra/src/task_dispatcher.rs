//! Task dispatcher: turns a payload into a published task envelope.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use rollcall_core::TaskId;
use rollcall_events::{Broker, BrokerError, Exchange, TaskEnvelope, TaskKind};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker rejected task: {0}")]
    Publish(#[from] BrokerError),
}

/// Publishes tasks to the broker. Cheap to clone.
///
/// No retries here: a failed publish is reported to the caller, which decides
/// whether the originating request fails.
#[derive(Clone)]
pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
}

impl core::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskDispatcher").finish_non_exhaustive()
    }
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish `payload` as a `task_kind` task on `exchange`.
    ///
    /// A `when` in the future marks the envelope for delayed execution;
    /// otherwise it is due immediately. Returns once the broker accepted it.
    #[instrument(skip(self, payload), fields(exchange = %exchange, kind = %task_kind), err)]
    pub async fn enqueue<P: Serialize>(
        &self,
        payload: &P,
        task_kind: TaskKind,
        exchange: Exchange,
        when: Option<DateTime<Utc>>,
    ) -> Result<TaskId, DispatchError> {
        let payload = serde_json::to_value(payload)?;
        let envelope = TaskEnvelope::new(exchange, task_kind, payload).with_schedule(when);
        let task_id = envelope.task_id();

        debug!(task_id = %task_id, mode = ?envelope.delivery_mode(), "publishing task");
        self.broker.publish(envelope).await?;
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rollcall_events::{DeliveryMode, InMemoryBroker};
    use serde_json::json;

    #[tokio::test]
    async fn immediate_when_no_schedule() {
        let broker = InMemoryBroker::arc();
        let dispatcher = TaskDispatcher::new(broker.clone());

        let id = dispatcher
            .enqueue(&json!({"username": "bob"}), "create".into(), "user".into(), None)
            .await
            .unwrap();

        let sub = broker.consume(&Exchange::new("user")).await.unwrap();
        let delivery = sub.try_recv().unwrap();
        assert_eq!(delivery.envelope().task_id(), id);
        assert_eq!(delivery.envelope().kind().as_str(), "create");
        assert_eq!(delivery.envelope().delivery_mode(), DeliveryMode::Immediate);
        assert_eq!(delivery.envelope().payload()["username"], "bob");
    }

    #[tokio::test]
    async fn future_when_is_delayed() {
        let broker = InMemoryBroker::arc();
        let dispatcher = TaskDispatcher::new(broker.clone());
        let at = Utc::now() + Duration::minutes(5);

        dispatcher
            .enqueue(&json!({}), "create".into(), "user".into(), Some(at))
            .await
            .unwrap();

        let sub = broker.consume(&Exchange::new("user")).await.unwrap();
        assert_eq!(sub.try_recv().unwrap().envelope().delivery_mode(), DeliveryMode::Delayed(at));
    }

    #[tokio::test]
    async fn closed_broker_fails_the_enqueue() {
        let broker = InMemoryBroker::arc();
        broker.close().await.unwrap();
        let dispatcher = TaskDispatcher::new(broker);

        let err = dispatcher
            .enqueue(&json!({}), "create".into(), "user".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Publish(BrokerError::Closed)));
    }
}
