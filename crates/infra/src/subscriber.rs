//! Long-lived subscription loops.
//!
//! Each subscription runs on its own thread: ensure the subscription exists,
//! then receive and hand every message to the handler until shutdown. A
//! receive session that fails (or whose stream ends) is retried after a delay;
//! too many consecutive failures end the loop with
//! [`SubscriptionError::Exhausted`] so the process can exit and be restarted.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use jobrelay_core::{CancellationToken, Context};
use jobrelay_events::{BusError, Message, MessageBus, ReceiveSettings, SubscriptionConfig};

use crate::publisher::ensure_subscription;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Consecutive failed sessions tolerated before giving up.
    pub max_consecutive_failures: u32,
    /// Pause before every new receive session after the first.
    pub retry_delay: Duration,
    pub receive: ReceiveSettings,
    /// How often an idle loop checks for shutdown.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            retry_delay: Duration::from_secs(2),
            receive: ReceiveSettings::default(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription {subscription} could not be set up: {source}")]
    Setup {
        subscription: String,
        #[source]
        source: BusError,
    },

    #[error("subscription {subscription} failed {failures} consecutive times; last error: {last}")]
    Exhausted {
        subscription: String,
        failures: u32,
        last: String,
    },
}

/// Handle to a running subscription loop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    subscription: String,
    shutdown: CancellationToken,
    join: Option<thread::JoinHandle<Result<(), SubscriptionError>>>,
}

impl SubscriptionHandle {
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Wait for the loop to end on its own (shutdown token or exhaustion).
    pub fn join(mut self) -> Result<(), SubscriptionError> {
        match self.join.take() {
            Some(j) => j.join().unwrap_or_else(|_| {
                error!(subscription = %self.subscription, "subscription thread panicked");
                Ok(())
            }),
            None => Ok(()),
        }
    }

    /// Request shutdown and wait for the loop to stop.
    pub fn shutdown(self) -> Result<(), SubscriptionError> {
        self.shutdown.cancel();
        self.join()
    }
}

/// Spawns subscription loops.
#[derive(Debug)]
pub struct SubscriptionRunner;

impl SubscriptionRunner {
    /// Run `handler` for every message on `subscription` until `shutdown` is
    /// cancelled or the loop gives up.
    ///
    /// The handler owns the message: it settles it (ack/nack) or lets it drop,
    /// which nacks. Handler panics are contained to the message.
    pub fn spawn<B, H>(
        bus: B,
        subscription: impl Into<String>,
        config: SubscriptionConfig,
        runner: RunnerConfig,
        shutdown: CancellationToken,
        handler: H,
    ) -> SubscriptionHandle
    where
        B: MessageBus + 'static,
        H: Fn(&Context, Message) + Send + 'static,
    {
        let subscription = subscription.into();
        let name = subscription.clone();
        let token = shutdown.clone();
        let join = thread::Builder::new()
            .name(format!("sub:{subscription}"))
            .spawn(move || run_loop(&bus, &name, &config, &runner, &token, &handler))
            .expect("failed to spawn subscription thread");

        SubscriptionHandle {
            subscription,
            shutdown,
            join: Some(join),
        }
    }
}

fn run_loop<B, H>(
    bus: &B,
    subscription: &str,
    config: &SubscriptionConfig,
    runner: &RunnerConfig,
    shutdown: &CancellationToken,
    handler: &H,
) -> Result<(), SubscriptionError>
where
    B: MessageBus,
    H: Fn(&Context, Message),
{
    ensure_subscription(bus, subscription, config).map_err(|source| {
        error!(subscription, error = %source, "subscription setup failed");
        SubscriptionError::Setup {
            subscription: subscription.to_string(),
            source,
        }
    })?;
    info!(subscription, topic = %config.topic, "subscription loop started");

    let mut failures = 0u32;
    let mut first = true;
    loop {
        if !first && shutdown.wait_timeout(runner.retry_delay) {
            break;
        }
        first = false;
        if shutdown.is_cancelled() {
            break;
        }

        let last = match bus.subscribe(subscription, &runner.receive) {
            Ok(messages) => {
                let mut received = false;
                loop {
                    if shutdown.is_cancelled() {
                        info!(subscription, "subscription loop stopped");
                        return Ok(());
                    }
                    match messages.recv_timeout(runner.poll_interval) {
                        Ok(msg) => {
                            if !received {
                                received = true;
                                failures = 0;
                            }
                            let ctx = Context::new(shutdown.clone());
                            let message_id = msg.id().to_string();
                            if catch_unwind(AssertUnwindSafe(|| handler(&ctx, msg))).is_err() {
                                error!(subscription, message_id = %message_id, "message handler panicked");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                "receive stream ended".to_string()
            }
            Err(err) => err.to_string(),
        };

        failures += 1;
        warn!(subscription, failures, error = %last, "subscription receive failed");
        if failures > runner.max_consecutive_failures {
            error!(subscription, failures, error = %last, "subscription gave up");
            return Err(SubscriptionError::Exhausted {
                subscription: subscription.to_string(),
                failures,
                last,
            });
        }
    }

    info!(subscription, "subscription loop stopped");
    Ok(())
}
