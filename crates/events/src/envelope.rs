use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use rollcall_core::TaskId;

macro_rules! impl_name_newtype {
    ($t:ident) => {
        impl $t {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

/// Named routing target on the broker (e.g. `"user"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Exchange(String);

/// Task kind tag within an exchange (e.g. `"create"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl_name_newtype!(Exchange);
impl_name_newtype!(TaskKind);

/// Handler routing key: envelopes are dispatched on `(exchange, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub exchange: Exchange,
    pub kind: TaskKind,
}

impl RouteKey {
    pub fn new(exchange: impl Into<Exchange>, kind: impl Into<TaskKind>) -> Self {
        Self {
            exchange: exchange.into(),
            kind: kind.into(),
        }
    }
}

impl core::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.kind)
    }
}

/// How the delivery layer must treat an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Eligible for execution as soon as a consumer is available.
    Immediate,
    /// Must not execute before the given instant (lower bound only).
    Delayed(DateTime<Utc>),
}

/// Envelope for a task, the unit published to and consumed from the broker.
///
/// Notes:
/// - `payload` is opaque to the broker and kind-specific to the handler.
/// - `execute_at` absent or in the past means "due now".
/// - `attempt` is 0 on first publish and bumped on every retry republish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    exchange: Exchange,
    kind: TaskKind,
    payload: JsonValue,
    published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attempt: u32,
}

impl TaskEnvelope {
    /// Build an envelope marked for immediate execution.
    pub fn new(exchange: impl Into<Exchange>, kind: impl Into<TaskKind>, payload: JsonValue) -> Self {
        Self {
            task_id: TaskId::new(),
            exchange: exchange.into(),
            kind: kind.into(),
            payload,
            published_at: Utc::now(),
            execute_at: None,
            attempt: 0,
        }
    }

    /// Mark the envelope for delayed execution if `when` lies in the future.
    ///
    /// A past or present `when` leaves it marked for immediate execution.
    pub fn with_schedule(mut self, when: Option<DateTime<Utc>>) -> Self {
        self.execute_at = when.filter(|at| *at > self.published_at);
        self
    }

    /// Copy for a retry: same task id, next attempt, not before `at`.
    pub fn into_retry(mut self, at: DateTime<Utc>) -> Self {
        self.attempt += 1;
        self.published_at = Utc::now();
        self.execute_at = Some(at);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey {
            exchange: self.exchange.clone(),
            kind: self.kind.clone(),
        }
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn execute_at(&self) -> Option<DateTime<Utc>> {
        self.execute_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self.execute_at {
            Some(at) => DeliveryMode::Delayed(at),
            None => DeliveryMode::Immediate,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at.map_or(true, |at| now >= at)
    }

    /// Remaining wait before the envelope becomes due, `None` if already due.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let at = self.execute_at?;
        (at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn no_schedule_is_immediate() {
        let env = TaskEnvelope::new("user", "create", json!({})).with_schedule(None);
        assert_eq!(env.delivery_mode(), DeliveryMode::Immediate);
        assert!(env.is_due(Utc::now()));
        assert_eq!(env.remaining_delay(Utc::now()), None);
    }

    #[test]
    fn past_schedule_is_immediate() {
        let env = TaskEnvelope::new("user", "create", json!({}))
            .with_schedule(Some(Utc::now() - Duration::minutes(1)));
        assert_eq!(env.delivery_mode(), DeliveryMode::Immediate);
    }

    #[test]
    fn future_schedule_is_delayed() {
        let at = Utc::now() + Duration::minutes(5);
        let env = TaskEnvelope::new("user", "create", json!({})).with_schedule(Some(at));

        assert_eq!(env.delivery_mode(), DeliveryMode::Delayed(at));
        assert!(!env.is_due(at - Duration::seconds(1)));
        assert!(env.is_due(at));
        assert!(env.remaining_delay(at - Duration::seconds(30)).is_some());
    }

    #[test]
    fn retry_keeps_identity_and_bumps_attempt() {
        let env = TaskEnvelope::new("user", "create", json!({"username": "bob"}));
        let id = env.task_id();
        let at = Utc::now() + Duration::seconds(2);

        let retry = env.into_retry(at);
        assert_eq!(retry.task_id(), id);
        assert_eq!(retry.attempt(), 1);
        assert_eq!(retry.execute_at(), Some(at));
        assert_eq!(retry.payload()["username"], "bob");
    }

    #[test]
    fn wire_format_omits_absent_schedule() {
        let env = TaskEnvelope::new("user", "create", json!({"username": "bob"}));
        let wire = serde_json::to_value(&env).unwrap();

        assert_eq!(wire["exchange"], "user");
        assert_eq!(wire["kind"], "create");
        assert!(wire.get("execute_at").is_none());

        let back: TaskEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn route_key_displays_as_path() {
        assert_eq!(RouteKey::new("user", "create").to_string(), "user/create");
    }
}
