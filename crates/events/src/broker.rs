//! Task broker abstraction (mechanics only).
//!
//! A broker admits [`TaskEnvelope`]s into a per-exchange queue and hands them
//! to consumers as [`Delivery`]s. Queue semantics, not broadcast: each
//! delivery goes to exactly one of the consumers subscribed to its exchange.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is neither acked nor dead-lettered may
//!   be handed out again (durable brokers redeliver after a crash). Handlers
//!   must tolerate duplicates.
//! - **Ordering**: FIFO per exchange as far as the backing broker provides it;
//!   nothing across exchanges.
//! - **Delay**: the broker transports `execute_at` untouched. Holding a task
//!   until it is due is the consumer's job.
//!
//! ## Settlement
//!
//! Every delivery must end in exactly one of [`Broker::ack`] (processed, may be
//! discarded) or [`Broker::dead_letter`] (failed for good, kept for
//! inspection). Retrying is expressed as "publish a delayed copy, then ack".

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::envelope::{Exchange, TaskEnvelope};

/// Broker-assigned identifier of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One envelope handed to one consumer, awaiting settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    tag: DeliveryTag,
    envelope: TaskEnvelope,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, envelope: TaskEnvelope) -> Self {
        Self { tag, envelope }
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,

    #[error("broker state lock poisoned")]
    Poisoned,

    #[error("unknown delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("envelope serialization error: {0}")]
    Serialization(String),
}

/// A consumer's view of one exchange queue.
///
/// Clones share the same underlying queue, so several workers holding clones
/// compete for deliveries rather than each receiving a copy.
#[derive(Debug, Clone)]
pub struct Subscription {
    exchange: Exchange,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Subscription {
    pub fn new(exchange: Exchange, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self::shared(exchange, Arc::new(Mutex::new(receiver)))
    }

    pub fn shared(exchange: Exchange, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>) -> Self {
        Self { exchange, receiver }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Wait for the next delivery. `None` once the broker side is closed and drained.
    pub async fn recv(&self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }

    /// Take a delivery if one is ready right now.
    pub fn try_recv(&self) -> Option<Delivery> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

/// Durable task queue (transport-agnostic).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Admit one envelope into its exchange queue.
    ///
    /// Returns once the broker has accepted the message, not once it has been
    /// processed.
    async fn publish(&self, envelope: TaskEnvelope) -> Result<(), BrokerError>;

    /// Subscribe to an exchange queue (created on first use).
    async fn consume(&self, exchange: &Exchange) -> Result<Subscription, BrokerError>;

    /// Settle a delivery as fully processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Settle a delivery as permanently failed, keeping it for inspection.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    /// Release broker resources. Further publishes fail with [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        (**self).publish(envelope).await
    }

    async fn consume(&self, exchange: &Exchange) -> Result<Subscription, BrokerError> {
        (**self).consume(exchange).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        (**self).dead_letter(delivery, reason).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}
