//! Task envelopes and the broker they travel through.

pub mod broker;
pub mod envelope;
pub mod in_memory_broker;

pub use broker::{Broker, BrokerError, Delivery, DeliveryTag, Subscription};
pub use envelope::{DeliveryMode, Exchange, RouteKey, TaskEnvelope, TaskKind};
pub use in_memory_broker::{DeadLetter, InMemoryBroker};
