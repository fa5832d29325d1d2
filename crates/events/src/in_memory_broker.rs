//! In-memory task broker for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag, Subscription};
use crate::envelope::{Exchange, TaskEnvelope};

/// A delivery that was settled as permanently failed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: TaskEnvelope,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<Exchange, Queue>,
    unacked: HashMap<DeliveryTag, TaskEnvelope>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
    closed: bool,
}

/// In-memory queue broker.
///
/// - One FIFO queue per exchange, competing consumers
/// - Messages stay "unacked" from publish until ack/dead-letter
/// - No durability: a process restart loses everything
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Messages admitted but not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().map(|s| s.unacked.len()).unwrap_or_default()
    }

    /// Snapshot of dead-lettered messages, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        if state.closed {
            return Err(BrokerError::Closed);
        }

        state.next_tag += 1;
        let tag = DeliveryTag::new(state.next_tag.to_string());
        let exchange = envelope.exchange().clone();
        state.unacked.insert(tag.clone(), envelope.clone());

        let queue = state.queues.entry(exchange).or_insert_with(Queue::new);
        queue
            .sender
            .send(Delivery::new(tag, envelope))
            .map_err(|_| BrokerError::Closed)
    }

    async fn consume(&self, exchange: &Exchange) -> Result<Subscription, BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let queue = state.queues.entry(exchange.clone()).or_insert_with(Queue::new);
        Ok(Subscription::shared(exchange.clone(), queue.receiver.clone()))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        state
            .unacked
            .remove(delivery.tag())
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag().clone()))
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        let envelope = state
            .unacked
            .remove(delivery.tag())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag().clone()))?;

        tracing::warn!(
            task_id = %envelope.task_id(),
            exchange = %envelope.exchange(),
            kind = %envelope.kind(),
            reason,
            "task dead-lettered"
        );
        state.dead_letters.push(DeadLetter {
            envelope,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::Poisoned)?;
        state.closed = true;
        // Dropping the senders ends every subscription once drained.
        state.queues.clear();
        Ok(())
    }
}
