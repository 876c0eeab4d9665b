//! Message bus abstraction (mechanics only).
//!
//! The bus is the **transport** between publishers and the subscription
//! loops that dispatch work. It makes few promises:
//!
//! - **At-least-once**: a message may be delivered more than once (redelivery
//!   after a nack, a crashed consumer, an idle pending entry being reclaimed).
//!   Consumers that cannot tolerate duplicates guard themselves (the trigger
//!   dispatcher uses a distributed lock for this).
//! - **No ordering** across publishers or across competing receivers.
//! - **Explicit acknowledgement**: a delivered [`Message`] stays in flight until
//!   it is acked. Dropping it un-acked makes it eligible for redelivery and,
//!   with a [`DeadLetterPolicy`], for dead-lettering after repeated failures.
//!
//! ## Naming
//!
//! A *topic* is where messages are published. A *subscription* is a named,
//! durable cursor over one topic; every subscription of a topic receives every
//! message, and competing receivers on one subscription share its messages.

use std::sync::{Arc, Weak};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::message::Message;

/// A live receive stream for one subscription.
///
/// ```ignore
/// let sub = bus.subscribe("uat-trigger-job.sub.jobrelay", &ReceiveSettings::default())?;
///
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(msg) => handle(msg),
///         Err(RecvTimeoutError::Timeout) => continue,       // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,     // transport gone
///     }
/// }
/// ```
///
/// A disconnected subscription means the transport behind it failed or the
/// bus was dropped; callers re-subscribe (see the infra subscription runner).
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    _lease: Option<Arc<()>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            _lease: None,
        }
    }

    /// A subscription whose producer polls [`SubscriptionLease::is_held`] to
    /// notice that the receiving side went away, even while no message is sent.
    pub fn leased(receiver: Receiver<M>) -> (Self, SubscriptionLease) {
        let lease = Arc::new(());
        let watch = SubscriptionLease(Arc::downgrade(&lease));
        (
            Self {
                receiver,
                _lease: Some(lease),
            },
            watch,
        )
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Producer-side view of a leased [`Subscription`].
#[derive(Debug, Clone)]
pub struct SubscriptionLease(Weak<()>);

impl SubscriptionLease {
    /// `false` once the subscription has been dropped.
    pub fn is_held(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Forward messages that failed delivery repeatedly to another topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Topic that receives the dead-lettered payloads.
    pub topic: String,
    /// Delivery attempts after which a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn new(topic: impl Into<String>, max_delivery_attempts: u32) -> Self {
        Self {
            topic: topic.into(),
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }
}

/// Configuration used when a subscription is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub dead_letter: Option<DeadLetterPolicy>,
}

impl SubscriptionConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = Some(policy);
        self
    }
}

/// Receive-side flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Upper bound on delivered-but-unacked messages held by one receiver.
    pub max_outstanding_messages: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1,
        }
    }
}

impl ReceiveSettings {
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding_messages = max.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("bus closed")]
    Closed,
}

/// Transport-agnostic message bus.
///
/// `publish` returns only after the transport confirmed the write; the
/// returned string is the transport's message id.
///
/// Implementations must be `Send + Sync`: publishers on many threads share one
/// bus, and each subscription loop runs on its own thread.
pub trait MessageBus: Send + Sync {
    fn topic_exists(&self, topic: &str) -> Result<bool, BusError>;

    fn create_topic(&self, topic: &str) -> Result<(), BusError>;

    fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError>;

    fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<(), BusError>;

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, BusError>;

    fn subscribe(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<Subscription<Message>, BusError>;
}

impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        (**self).topic_exists(topic)
    }

    fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        (**self).create_topic(topic)
    }

    fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        (**self).subscription_exists(subscription)
    }

    fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<(), BusError> {
        (**self).create_subscription(subscription, config)
    }

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, BusError> {
        (**self).publish(topic, data)
    }

    fn subscribe(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<Subscription<Message>, BusError> {
        (**self).subscribe(subscription, settings)
    }
}
