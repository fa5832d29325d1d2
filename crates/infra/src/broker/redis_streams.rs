//! Redis Streams-backed task broker (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `rollcall:tasks:<exchange>` (one stream per exchange)
//! - **Consumer Group**: one per exchange stream, shared by every process
//!   (competing consumers)
//! - **Consumers**: one named consumer per broker instance (random unless
//!   set with [`RedisStreamsBroker::with_consumer_name`])
//! - **Dead-Letter Queue**: `rollcall:tasks:<exchange>:dlq`
//!
//! On subscribe the reader:
//! 1. re-reads its own pending entries (id `0`), so deliveries never acked
//!    before a restart are handed out again;
//! 2. claims entries other consumers left pending for longer than the claim
//!    idle time (`XAUTOCLAIM`), which covers consumers that never come back;
//! 3. switches to new entries (`>`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use rollcall_events::{Broker, BrokerError, Delivery, DeliveryTag, Exchange, Subscription, TaskEnvelope};

/// Default prefix for stream keys
const DEFAULT_KEY_PREFIX: &str = "rollcall:tasks";

/// Default consumer group name
const DEFAULT_GROUP: &str = "rollcall";

/// Entries fetched per XREADGROUP call
const READ_BATCH: usize = 16;

/// XREADGROUP blocking timeout
const BLOCK_MS: usize = 1000;

/// Pending entries idle at least this long may be claimed from other consumers.
const DEFAULT_CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);

pub struct RedisStreamsBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    key_prefix: String,
    group: String,
    consumer_name: String,
    claim_min_idle: Duration,
    closed: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("key_prefix", &self.key_prefix)
            .field("group", &self.group)
            .field("consumer_name", &self.consumer_name)
            .field("claim_min_idle", &self.claim_min_idle)
            .finish_non_exhaustive()
    }
}

fn connection_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command_error(command: &str) -> impl FnOnce(redis::RedisError) -> BrokerError + '_ {
    move |e| BrokerError::Command(format!("{command} failed: {e}"))
}

impl RedisStreamsBroker {
    /// Connect to Redis.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Stream key prefix (default: "rollcall:tasks")
    pub async fn connect(redis_url: &str, key_prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(connection_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;

        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            group: DEFAULT_GROUP.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            claim_min_idle: DEFAULT_CLAIM_MIN_IDLE,
            closed: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Use a stable consumer name so pending entries survive a restart.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// How long another consumer's entry must sit unacked before it is claimed.
    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }

    pub fn stream_key(&self, exchange: &Exchange) -> String {
        stream_key(&self.key_prefix, exchange)
    }

    pub fn dlq_key(&self, exchange: &Exchange) -> String {
        format!("{}:dlq", self.stream_key(exchange))
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Ensure the consumer group exists (idempotent).
    async fn ensure_consumer_group(&self, stream: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, &self.group, "0").await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE")(e)),
        }
    }
}

fn stream_key(prefix: &str, exchange: &Exchange) -> String {
    format!("{prefix}:{exchange}")
}

/// Turn one stream entry into a delivery; `Err` carries the reason it is unusable.
fn parse_entry(entry: &StreamId) -> Result<Delivery, String> {
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| "missing payload field".to_string())?;
    let envelope: TaskEnvelope =
        serde_json::from_str(&payload).map_err(|e| format!("undecodable envelope: {e}"))?;
    Ok(Delivery::new(DeliveryTag::new(entry.id.clone()), envelope))
}

/// Split an `XAUTOCLAIM` reply into the next start id and the claimed entries.
///
/// Entries deleted from the stream while pending come back as nil (Redis 6.2)
/// and are skipped; the Redis 7 list of deleted ids is ignored.
fn parse_autoclaim(reply: &redis::Value) -> Result<(String, Vec<StreamId>), String> {
    let malformed = || format!("unexpected XAUTOCLAIM reply: {reply:?}");

    let redis::Value::Bulk(parts) = reply else {
        return Err(malformed());
    };
    let (Some(next), Some(redis::Value::Bulk(raw))) = (parts.first(), parts.get(1)) else {
        return Err(malformed());
    };
    let next: String = redis::from_redis_value(next).map_err(|e| e.to_string())?;

    let mut entries = Vec::with_capacity(raw.len());
    for item in raw {
        let redis::Value::Bulk(pair) = item else {
            continue;
        };
        let [id, redis::Value::Bulk(fields)] = pair.as_slice() else {
            return Err(malformed());
        };
        let id: String = redis::from_redis_value(id).map_err(|e| e.to_string())?;

        let mut map = HashMap::with_capacity(fields.len() / 2);
        for field in fields.chunks(2) {
            if let [key, value] = field {
                let key: String = redis::from_redis_value(key).map_err(|e| e.to_string())?;
                map.insert(key, value.clone());
            }
        }
        entries.push(StreamId { id, map });
    }
    Ok((next, entries))
}

struct Reader {
    conn: MultiplexedConnection,
    stream: String,
    dlq: String,
    group: String,
    consumer: String,
    claim_min_idle_ms: u64,
    closed: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Reader {
    async fn read(&mut self, id: &str, block: bool) -> redis::RedisResult<Vec<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH);
        if block {
            options = options.block(BLOCK_MS);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[id], &options)
            .await?;
        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn claim(&mut self, start: &str) -> Result<(String, Vec<StreamId>), String> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_min_idle_ms)
            .arg(start)
            .arg("COUNT")
            .arg(READ_BATCH)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| e.to_string())?;
        parse_autoclaim(&reply)
    }

    /// Hand entries to the subscription. Returns false once nobody listens.
    async fn forward(&mut self, entries: Vec<StreamId>) -> bool {
        for entry in entries {
            match parse_entry(&entry) {
                Ok(delivery) => {
                    if self.sender.send(delivery).is_err() {
                        return false;
                    }
                }
                Err(reason) => {
                    warn!(stream = %self.stream, message_id = %entry.id, reason = %reason, "poison entry moved to DLQ");
                    let moved: redis::RedisResult<()> = async {
                        let _: String = self
                            .conn
                            .xadd(&self.dlq, "*", &[("original_message_id", entry.id.as_str()), ("reason", reason.as_str())])
                            .await?;
                        let _: i64 = self.conn.xack(&self.stream, &self.group, &[entry.id.as_str()]).await?;
                        Ok(())
                    }
                    .await;
                    if let Err(e) = moved {
                        error!(stream = %self.stream, error = %e, "failed to move poison entry");
                    }
                }
            }
        }
        true
    }

    async fn run(mut self) {
        // Own pending entries first (unacked before a restart).
        let mut redelivered = HashSet::new();
        let mut cursor = "0".to_string();
        loop {
            match self.read(&cursor, false).await {
                Ok(entries) if entries.is_empty() => break,
                Ok(entries) => {
                    if let Some(last) = entries.last() {
                        cursor = last.id.clone();
                    }
                    redelivered.extend(entries.iter().map(|e| e.id.clone()));
                    if !self.forward(entries).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "failed to read pending entries");
                    break;
                }
            }
        }

        // Then entries abandoned by other consumers.
        let mut start = "0-0".to_string();
        loop {
            match self.claim(&start).await {
                Ok((next, entries)) => {
                    let entries: Vec<StreamId> = entries
                        .into_iter()
                        .filter(|e| !redelivered.contains(&e.id))
                        .collect();
                    if !entries.is_empty() {
                        info!(stream = %self.stream, claimed = entries.len(), "claimed idle entries from other consumers");
                    }
                    if !self.forward(entries).await {
                        return;
                    }
                    if next == "0-0" {
                        break;
                    }
                    start = next;
                }
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "XAUTOCLAIM failed");
                    break;
                }
            }
        }

        while !self.closed.load(Ordering::SeqCst) && !self.sender.is_closed() {
            match self.read(">", true).await {
                Ok(entries) => {
                    if !self.forward(entries).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "XREADGROUP failed");
                    tokio::time::sleep(std::time::Duration::from_millis(BLOCK_MS as u64)).await;
                }
            }
        }
        debug!(stream = %self.stream, "stream reader stopped");
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(
        skip(self, envelope),
        fields(
            exchange = %envelope.exchange(),
            kind = %envelope.kind(),
            task_id = %envelope.task_id()
        ),
        err
    )]
    async fn publish(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let payload = serde_json::to_string(&envelope).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let stream = self.stream_key(envelope.exchange());

        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                &stream,
                "*",
                &[("kind", envelope.kind().as_str()), ("payload", payload.as_str())],
            )
            .await
            .map_err(command_error("XADD"))?;
        Ok(())
    }

    #[instrument(skip(self, exchange), fields(exchange = %exchange), err)]
    async fn consume(&self, exchange: &Exchange) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;
        let stream = self.stream_key(exchange);
        self.ensure_consumer_group(&stream).await?;

        // Blocking reads get their own connection so they never stall publishes.
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let reader = Reader {
            conn,
            dlq: self.dlq_key(exchange),
            stream,
            group: self.group.clone(),
            consumer: self.consumer_name.clone(),
            claim_min_idle_ms: u64::try_from(self.claim_min_idle.as_millis()).unwrap_or(u64::MAX),
            closed: self.closed.clone(),
            sender,
        };

        let join = tokio::spawn(reader.run());
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(join);

        Ok(Subscription::new(exchange.clone(), receiver))
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.tag()), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let stream = self.stream_key(delivery.envelope().exchange());
        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&stream, &self.group, &[delivery.tag().as_str()])
            .await
            .map_err(command_error("XACK"))?;

        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag().clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.tag()), err)]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let envelope = delivery.envelope();
        let payload = serde_json::to_string(envelope).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let failed_at = chrono::Utc::now().to_rfc3339();
        let attempt = envelope.attempt().to_string();

        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                self.dlq_key(envelope.exchange()),
                "*",
                &[
                    ("original_message_id", delivery.tag().as_str()),
                    ("reason", reason),
                    ("attempt", attempt.as_str()),
                    ("failed_at", failed_at.as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .await
            .map_err(command_error("DLQ XADD"))?;

        warn!(reason = %reason, "task sent to dead-letter queue");
        self.ack(delivery).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        let readers: Vec<JoinHandle<()>> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for reader in readers {
            reader.abort();
        }
        Ok(())
    }
}
