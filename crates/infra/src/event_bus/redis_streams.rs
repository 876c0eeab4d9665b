//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! ## Mapping
//!
//! - **Topic**: one stream per topic, keyed by the topic name
//! - **Subscription**: one consumer group per subscription on its topic's
//!   stream, created at `$` so it sees messages published after it exists
//! - **Receiver**: one uniquely named consumer per `subscribe` call
//! - **Registry**: `{namespace}:subscriptions` hash of subscription → config
//!
//! ## Delivery
//!
//! - `ack` is `XACK`; `nack` leaves the entry pending
//! - pending entries idle longer than `claim_idle` are `XCLAIM`ed by a live
//!   receiver and redelivered with the next attempt number
//! - with a dead-letter policy, an entry that reached its delivery budget is
//!   copied to the dead-letter stream and acked instead of being reclaimed
//!
//! Payloads travel in the `data` field of each entry.

use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use jobrelay_events::{
    Acker, BusError, DeadLetterPolicy, Message, MessageBus, ReceiveSettings, Subscription,
    SubscriptionConfig, SubscriptionLease,
};

const DEFAULT_NAMESPACE: &str = "jobrelay";

/// How long one XREADGROUP blocks waiting for new entries.
const DEFAULT_BLOCK_MS: u64 = 1000;

/// Pending entries idle for longer than this are redelivered.
const DEFAULT_CLAIM_IDLE_MS: u64 = 30_000;

const DATA_FIELD: &str = "data";

#[derive(Debug, Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    registry_key: String,
    block_ms: u64,
    claim_idle_ms: u64,
}

/// Subscription config as stored in the registry hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSubscription {
    topic: String,
    dead_letter_topic: Option<String>,
    #[serde(default)]
    max_delivery_attempts: u32,
}

impl From<&SubscriptionConfig> for StoredSubscription {
    fn from(config: &SubscriptionConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            dead_letter_topic: config.dead_letter.as_ref().map(|p| p.topic.clone()),
            max_delivery_attempts: config
                .dead_letter
                .as_ref()
                .map_or(0, |p| p.max_delivery_attempts),
        }
    }
}

impl StoredSubscription {
    fn dead_letter(&self) -> Option<DeadLetterPolicy> {
        self.dead_letter_topic
            .as_ref()
            .map(|topic| DeadLetterPolicy::new(topic.clone(), self.max_delivery_attempts))
    }
}

fn transport(op: &str) -> impl FnOnce(redis::RedisError) -> BusError + '_ {
    move |e| BusError::Transport(format!("{op} failed: {e}"))
}

impl RedisStreamsBus {
    /// Create a bus over `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Transport(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            registry_key: format!("{DEFAULT_NAMESPACE}:subscriptions"),
            block_ms: DEFAULT_BLOCK_MS,
            claim_idle_ms: DEFAULT_CLAIM_IDLE_MS,
        })
    }

    /// Keep the subscription registry under another namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.registry_key = format!("{namespace}:subscriptions");
        self
    }

    /// Redeliver pending entries after `idle` without an ack.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle_ms = (idle.as_millis() as u64).max(1);
        self
    }

    fn connection(&self) -> Result<redis::Connection, BusError> {
        self.client
            .get_connection()
            .map_err(|e| BusError::Transport(format!("redis connection failed: {e}")))
    }

    fn stored_subscription(
        &self,
        conn: &mut redis::Connection,
        subscription: &str,
    ) -> Result<StoredSubscription, BusError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.registry_key)
            .arg(subscription)
            .query(conn)
            .map_err(transport("HGET"))?;
        let raw = raw.ok_or_else(|| BusError::SubscriptionNotFound(subscription.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

impl MessageBus for RedisStreamsBus {
    fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        let mut conn = self.connection()?;
        let n: i64 = redis::cmd("EXISTS")
            .arg(topic)
            .query(&mut conn)
            .map_err(transport("EXISTS"))?;
        Ok(n > 0)
    }

    #[instrument(skip(self), err)]
    fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        if self.topic_exists(topic)? {
            return Err(BusError::AlreadyExists(topic.to_string()));
        }
        let mut conn = self.connection()?;
        // Streams outlive their last entry, so an add trimmed to zero leaves
        // an empty stream behind.
        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg(0)
            .arg("*")
            .arg("init")
            .arg(1)
            .query(&mut conn)
            .map_err(transport("XADD"))?;
        Ok(())
    }

    fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        let mut conn = self.connection()?;
        redis::cmd("HEXISTS")
            .arg(&self.registry_key)
            .arg(subscription)
            .query(&mut conn)
            .map_err(transport("HEXISTS"))
    }

    #[instrument(skip(self, config), fields(topic = %config.topic), err)]
    fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<(), BusError> {
        if !self.topic_exists(&config.topic)? {
            return Err(BusError::TopicNotFound(config.topic.clone()));
        }
        let stored = serde_json::to_string(&StoredSubscription::from(config))
            .map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        // Group first: a registry entry must never point at a missing group.
        let group: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.topic)
            .arg(subscription)
            .arg("$")
            .query(&mut conn);
        match group {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(BusError::Transport(format!("XGROUP CREATE failed: {e}"))),
        }

        let created: bool = redis::cmd("HSETNX")
            .arg(&self.registry_key)
            .arg(subscription)
            .arg(&stored)
            .query(&mut conn)
            .map_err(transport("HSETNX"))?;
        if !created {
            return Err(BusError::AlreadyExists(subscription.to_string()));
        }
        Ok(())
    }

    /// `XADD ... NOMKSTREAM`: publishing never creates a topic implicitly.
    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, BusError> {
        let mut conn = self.connection()?;
        let id: Option<String> = redis::cmd("XADD")
            .arg(topic)
            .arg("NOMKSTREAM")
            .arg("*")
            .arg(DATA_FIELD)
            .arg(data)
            .query(&mut conn)
            .map_err(transport("XADD"))?;
        id.ok_or_else(|| BusError::TopicNotFound(topic.to_string()))
    }

    fn subscribe(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<Subscription<Message>, BusError> {
        let mut conn = self.connection()?;
        let stored = self.stored_subscription(&mut conn, subscription)?;

        let consumer = format!("{subscription}-{}", uuid::Uuid::now_v7());
        let acker = Arc::new(StreamAcker {
            client: self.client.clone(),
            stream: stored.topic.clone(),
            group: subscription.to_string(),
        });
        let reader = StreamReader {
            stream: stored.topic.clone(),
            group: subscription.to_string(),
            consumer: consumer.clone(),
            dead_letter: stored.dead_letter(),
            batch: settings.max_outstanding_messages.max(1),
            block_ms: self.block_ms,
            claim_idle_ms: self.claim_idle_ms,
            acker,
        };

        let (tx, rx) = mpsc::sync_channel(settings.max_outstanding_messages.max(1));
        let (sub, lease) = Subscription::leased(rx);
        thread::Builder::new()
            .name(format!("xread:{subscription}"))
            .spawn(move || reader.run(conn, tx, lease))
            .map_err(|e| BusError::Transport(format!("spawn stream reader: {e}")))?;

        info!(subscription, consumer = %consumer, "stream consumer started");
        Ok(sub)
    }
}

#[derive(Debug)]
struct StreamAcker {
    client: redis::Client,
    stream: String,
    group: String,
}

impl Acker for StreamAcker {
    fn ack(&self, message_id: &str) {
        let result = self.client.get_connection().and_then(|mut conn| {
            redis::cmd("XACK")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(message_id)
                .query::<i64>(&mut conn)
        });
        if let Err(e) = result {
            // The entry stays pending and is redelivered after the idle timeout.
            error!(stream = %self.stream, group = %self.group, message_id, error = %e, "XACK failed");
        }
    }

    fn nack(&self, message_id: &str) {
        debug!(stream = %self.stream, group = %self.group, message_id, "nacked; left pending for redelivery");
    }
}

/// One entry of a stream reply; `data` is `None` for entries without payload
/// (or trimmed away since they were delivered).
struct Entry {
    id: String,
    data: Option<Vec<u8>>,
}

struct StreamReader {
    stream: String,
    group: String,
    consumer: String,
    dead_letter: Option<DeadLetterPolicy>,
    batch: usize,
    block_ms: u64,
    claim_idle_ms: u64,
    acker: Arc<StreamAcker>,
}

impl StreamReader {
    /// Poll until the subscription is dropped or Redis fails. Returning drops
    /// the sender, which the receiving side sees as a disconnect.
    fn run(self, mut conn: redis::Connection, tx: SyncSender<Message>, lease: SubscriptionLease) {
        while lease.is_held() {
            let delivered = self
                .reclaim(&mut conn, &tx)
                .and_then(|ok| if ok { self.read_new(&mut conn, &tx) } else { Ok(false) });
            match delivered {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(stream = %self.stream, group = %self.group, error = %e, "stream read failed");
                    return;
                }
            }
        }
        debug!(stream = %self.stream, consumer = %self.consumer, "stream consumer stopped");
    }

    /// Hand `entry` to the receiver. `Ok(false)` when the receiver is gone.
    fn deliver(&self, tx: &SyncSender<Message>, entry: Entry, attempt: u32) -> bool {
        let Some(data) = entry.data else {
            warn!(stream = %self.stream, message_id = %entry.id, "entry without payload; acking");
            self.acker.ack(&entry.id);
            return true;
        };
        let msg = Message::new(entry.id, data, attempt, self.acker.clone());
        match tx.send(msg) {
            Ok(()) => true,
            Err(mpsc::SendError(msg)) => {
                // Leave it pending for another consumer.
                msg.disarm();
                false
            }
        }
    }

    /// Redeliver (or dead-letter) entries that sat unacked for too long.
    fn reclaim(&self, conn: &mut redis::Connection, tx: &SyncSender<Message>) -> Result<bool, BusError> {
        // [id, consumer, idle_ms, deliveries]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.batch)
            .query(conn)
            .map_err(transport("XPENDING"))?;

        for (id, _owner, _idle, deliveries) in pending {
            let deliveries = deliveries as u32;
            if let Some(policy) = &self.dead_letter {
                if deliveries >= policy.max_delivery_attempts {
                    self.dead_letter(conn, policy, &id, deliveries)?;
                    continue;
                }
            }

            let claimed: redis::Value = redis::cmd("XCLAIM")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(self.claim_idle_ms)
                .arg(&id)
                .query(conn)
                .map_err(transport("XCLAIM"))?;
            for entry in parse_entries(claimed) {
                debug!(stream = %self.stream, message_id = %entry.id, attempt = deliveries + 1, "redelivering");
                if !self.deliver(tx, entry, deliveries + 1) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Read never-delivered entries, blocking up to `block_ms`.
    fn read_new(&self, conn: &mut redis::Connection, tx: &SyncSender<Message>) -> Result<bool, BusError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query(conn)
            .map_err(transport("XREADGROUP"))?;

        // Nil on timeout, else [[stream, [entry...]]...].
        let redis::Value::Bulk(streams) = reply else {
            return Ok(true);
        };
        for stream in streams {
            let redis::Value::Bulk(mut parts) = stream else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            for entry in parse_entries(parts.swap_remove(1)) {
                if !self.deliver(tx, entry, 1) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        policy: &DeadLetterPolicy,
        id: &str,
        deliveries: u32,
    ) -> Result<(), BusError> {
        let range: redis::Value = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg(id)
            .arg(id)
            .query(conn)
            .map_err(transport("XRANGE"))?;

        if let Some(data) = parse_entries(range).into_iter().find_map(|e| e.data) {
            let _: Option<String> = redis::cmd("XADD")
                .arg(&policy.topic)
                .arg("NOMKSTREAM")
                .arg("*")
                .arg(DATA_FIELD)
                .arg(data)
                .arg("original_message_id")
                .arg(id)
                .arg("source_stream")
                .arg(&self.stream)
                .arg("delivery_attempts")
                .arg(deliveries)
                .arg("failed_at")
                .arg(chrono::Utc::now().to_rfc3339())
                .query(conn)
                .map_err(transport("dead-letter XADD"))?;
        }
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(transport("XACK"))?;

        warn!(
            stream = %self.stream,
            group = %self.group,
            message_id = %id,
            delivery_attempts = deliveries,
            dead_letter_topic = %policy.topic,
            "message sent to dead-letter topic"
        );
        Ok(())
    }
}

/// Parse `[[id, [field, value, ...]], ...]`. Entries whose fields are nil
/// (deleted since delivery) come back without data.
fn parse_entries(value: redis::Value) -> Vec<Entry> {
    let redis::Value::Bulk(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| {
            let redis::Value::Bulk(mut parts) = item else {
                return None;
            };
            if parts.is_empty() {
                return None;
            }
            let fields = if parts.len() > 1 {
                parts.swap_remove(1)
            } else {
                redis::Value::Nil
            };
            let id = match &parts[0] {
                redis::Value::Data(raw) => String::from_utf8_lossy(raw).into_owned(),
                redis::Value::Status(s) => s.clone(),
                _ => return None,
            };
            Some(Entry {
                id,
                data: field(fields, DATA_FIELD),
            })
        })
        .collect()
}

fn field(fields: redis::Value, name: &str) -> Option<Vec<u8>> {
    let redis::Value::Bulk(flat) = fields else {
        return None;
    };
    let mut it = flat.into_iter();
    while let (Some(key), Some(value)) = (it.next(), it.next()) {
        if let (redis::Value::Data(key), redis::Value::Data(value)) = (key, value) {
            if key == name.as_bytes() {
                return Some(value);
            }
        }
    }
    None
}
