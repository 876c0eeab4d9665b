//! Publishing commands onto the bus, and idempotent topic/subscription setup.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use jobrelay_core::{Context, ContextError};
use jobrelay_events::{
    BusError, DeadLetterPolicy, MessageBus, SubscriptionConfig, Topic, TriggerCommand,
    subscription_id,
};

use crate::distributor::distribute;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("publish aborted: {0}")]
    Cancelled(#[from] ContextError),
}

/// Create `topic` unless it exists. Losing a creation race is not an error.
pub fn ensure_topic<B: MessageBus + ?Sized>(bus: &B, topic: &str) -> Result<(), BusError> {
    if bus.topic_exists(topic)? {
        return Ok(());
    }
    match bus.create_topic(topic) {
        Ok(()) => {
            info!(topic, "topic created");
            Ok(())
        }
        Err(BusError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Create `subscription` with `config` unless it exists.
pub fn ensure_subscription<B: MessageBus + ?Sized>(
    bus: &B,
    subscription: &str,
    config: &SubscriptionConfig,
) -> Result<(), BusError> {
    if bus.subscription_exists(subscription)? {
        return Ok(());
    }
    match bus.create_subscription(subscription, config) {
        Ok(()) => {
            info!(subscription, topic = %config.topic, "subscription created");
            Ok(())
        }
        Err(BusError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// JSON publisher bound to one deployment environment and application id.
#[derive(Debug, Clone)]
pub struct Publisher<B> {
    bus: B,
    deploy_env: String,
    app_id: String,
}

impl<B: MessageBus> Publisher<B> {
    pub fn new(bus: B, deploy_env: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            bus,
            deploy_env: deploy_env.into(),
            app_id: app_id.into(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Bus-level name of a catalog topic in this environment.
    pub fn topic_name(&self, topic: Topic) -> String {
        topic.name(&self.deploy_env)
    }

    /// This application's subscription id on a catalog topic.
    pub fn subscription_name(&self, topic: Topic) -> String {
        subscription_id(&self.topic_name(topic), &self.app_id)
    }

    /// Serialise `message` as JSON and publish it, waiting for the bus to confirm.
    #[instrument(skip(self, ctx, message), fields(trace_id = %ctx.trace_id()), err)]
    pub fn publish<T>(&self, ctx: &Context, topic: &str, message: &T) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        let data = serde_json::to_vec(message)?;
        let id = self.bus.publish(topic, data)?;
        debug!(message_id = %id, "published");
        Ok(id)
    }

    /// Publish to a catalog topic in this environment.
    pub fn publish_to<T>(&self, ctx: &Context, topic: Topic, message: &T) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(ctx, &self.topic_name(topic), message)
    }

    /// Ask the fleet to run `job` once.
    pub fn trigger_job(&self, ctx: &Context, job: &str) -> Result<String, PublishError> {
        let id = self.publish_to(ctx, Topic::Trigger, &TriggerCommand::now(job))?;
        info!(job, message_id = %id, "job triggered");
        Ok(id)
    }

    /// Publish one message per id with bounded concurrency.
    ///
    /// Failures are logged per message and do not stop the others; returns
    /// how many publishes failed.
    pub fn publish_concurrently<T, F>(
        &self,
        ctx: &Context,
        topic: &str,
        ids: &[i64],
        concurrency: usize,
        make_message: F,
    ) -> usize
    where
        T: Serialize,
        F: Fn(i64) -> T + Sync,
    {
        let failed = AtomicUsize::new(0);
        distribute(ids.iter().copied(), concurrency, |id| {
            if let Err(err) = self.publish(ctx, topic, &make_message(id)) {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(id, topic, error = %err, "fan-out publish failed");
            }
        });
        failed.into_inner()
    }

    pub fn ensure_topic(&self, topic: &str) -> Result<(), BusError> {
        ensure_topic(&self.bus, topic)
    }

    pub fn ensure_subscription(
        &self,
        topic: &str,
        dead_letter: Option<DeadLetterPolicy>,
    ) -> Result<String, BusError> {
        let subscription = subscription_id(topic, &self.app_id);
        let config = SubscriptionConfig {
            topic: topic.to_string(),
            dead_letter,
        };
        ensure_subscription(&self.bus, &subscription, &config)?;
        Ok(subscription)
    }

    /// Ensure every catalog topic exists in this environment.
    pub fn ensure_topics(&self) -> Result<(), BusError> {
        for topic in Topic::ALL {
            self.ensure_topic(&self.topic_name(topic))?;
        }
        Ok(())
    }
}
