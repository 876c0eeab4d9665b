//! In-memory message bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc};

use tracing::{debug, warn};

use crate::bus::{BusError, MessageBus, ReceiveSettings, Subscription, SubscriptionConfig};
use crate::message::{Acker, Message};

/// In-memory topics and subscriptions.
///
/// - No IO
/// - Every subscription of a topic gets every message; competing receivers on
///   one subscription are served round-robin
/// - Messages published while a subscription has no receiver are kept in its
///   backlog and delivered on the next `subscribe`
/// - Nacked (or dropped) messages are redelivered, or dead-lettered once the
///   subscription's policy says so
///
/// `max_outstanding_messages` is not enforced; receivers buffer without bound.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_id: u64,
}

#[derive(Debug)]
struct SubscriptionState {
    config: SubscriptionConfig,
    receivers: Vec<mpsc::Sender<Message>>,
    next_receiver: usize,
    backlog: VecDeque<Pending>,
    in_flight: HashMap<String, Pending>,
}

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    data: Vec<u8>,
    attempts: u32,
}

#[derive(Debug)]
struct InMemoryAcker {
    state: Weak<Mutex<BusState>>,
    subscription: String,
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered on `subscription` and not yet settled.
    pub fn in_flight(&self, subscription: &str) -> usize {
        lock(&self.state)
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.in_flight.len())
    }

    /// Messages waiting for a receiver on `subscription`.
    pub fn backlog(&self, subscription: &str) -> usize {
        lock(&self.state)
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.backlog.len())
    }

    fn handle(&self) -> Weak<Mutex<BusState>> {
        Arc::downgrade(&self.state)
    }
}

impl BusState {
    fn publish(
        &mut self,
        handle: &Weak<Mutex<BusState>>,
        topic: &str,
        data: Vec<u8>,
    ) -> Result<String, BusError> {
        let subscriptions = self
            .topics
            .get(topic)
            .ok_or_else(|| BusError::TopicNotFound(topic.to_string()))?
            .clone();

        self.next_id += 1;
        let id = self.next_id.to_string();

        for subscription in subscriptions {
            self.deliver(
                handle,
                &subscription,
                Pending {
                    id: id.clone(),
                    data: data.clone(),
                    attempts: 1,
                },
            );
        }

        Ok(id)
    }

    fn deliver(&mut self, handle: &Weak<Mutex<BusState>>, subscription: &str, pending: Pending) {
        let Some(sub) = self.subscriptions.get_mut(subscription) else {
            return;
        };

        let acker: Arc<dyn Acker> = Arc::new(InMemoryAcker {
            state: handle.clone(),
            subscription: subscription.to_string(),
        });
        let mut msg = Message::new(pending.id.clone(), pending.data.clone(), pending.attempts, acker);
        sub.in_flight.insert(pending.id.clone(), pending.clone());

        while !sub.receivers.is_empty() {
            let idx = sub.next_receiver % sub.receivers.len();
            match sub.receivers[idx].send(msg) {
                Ok(()) => {
                    sub.next_receiver = idx + 1;
                    return;
                }
                Err(mpsc::SendError(returned)) => {
                    // Receiver is gone; try the next one.
                    sub.receivers.remove(idx);
                    msg = returned;
                }
            }
        }

        // Dropping `msg` here must not call back into the (locked) bus.
        msg.disarm();
        sub.in_flight.remove(&pending.id);
        sub.backlog.push_back(pending);
    }

    fn settle(
        &mut self,
        handle: &Weak<Mutex<BusState>>,
        subscription: &str,
        message_id: &str,
        handled: bool,
    ) {
        let Some(sub) = self.subscriptions.get_mut(subscription) else {
            return;
        };
        let Some(mut pending) = sub.in_flight.remove(message_id) else {
            return;
        };
        if handled {
            return;
        }

        if let Some(policy) = sub.config.dead_letter.clone() {
            if pending.attempts >= policy.max_delivery_attempts {
                warn!(
                    subscription,
                    message_id,
                    attempts = pending.attempts,
                    dead_letter_topic = %policy.topic,
                    "message sent to dead-letter topic"
                );
                if let Err(err) = self.publish(handle, &policy.topic, pending.data) {
                    warn!(subscription, message_id, error = %err, "dead-letter publish failed");
                }
                return;
            }
        }

        pending.attempts += 1;
        debug!(subscription, message_id, attempt = pending.attempts, "redelivering message");
        self.deliver(handle, subscription, pending);
    }
}

impl Acker for InMemoryAcker {
    fn ack(&self, message_id: &str) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).settle(&self.state, &self.subscription, message_id, true);
        }
    }

    fn nack(&self, message_id: &str) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).settle(&self.state, &self.subscription, message_id, false);
        }
    }
}

impl MessageBus for InMemoryMessageBus {
    fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        Ok(lock(&self.state).topics.contains_key(topic))
    }

    fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.topics.contains_key(topic) {
            return Err(BusError::AlreadyExists(topic.to_string()));
        }
        state.topics.insert(topic.to_string(), Vec::new());
        Ok(())
    }

    fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        Ok(lock(&self.state).subscriptions.contains_key(subscription))
    }

    fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.subscriptions.contains_key(subscription) {
            return Err(BusError::AlreadyExists(subscription.to_string()));
        }
        let subs = state
            .topics
            .get_mut(&config.topic)
            .ok_or_else(|| BusError::TopicNotFound(config.topic.clone()))?;
        subs.push(subscription.to_string());

        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                config: config.clone(),
                receivers: Vec::new(),
                next_receiver: 0,
                backlog: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );
        Ok(())
    }

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, BusError> {
        let handle = self.handle();
        lock(&self.state).publish(&handle, topic, data)
    }

    fn subscribe(
        &self,
        subscription: &str,
        _settings: &ReceiveSettings,
    ) -> Result<Subscription<Message>, BusError> {
        let handle = self.handle();
        let mut state = lock(&self.state);
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BusError::SubscriptionNotFound(subscription.to_string()))?;

        let (tx, rx) = mpsc::channel();
        sub.receivers.push(tx);
        let backlog: Vec<Pending> = sub.backlog.drain(..).collect();

        for pending in backlog {
            state.deliver(&handle, subscription, pending);
        }

        Ok(Subscription::new(rx))
    }
}
