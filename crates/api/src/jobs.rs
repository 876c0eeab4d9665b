//! Built-in jobs runnable through the trigger topic.
//!
//! Both jobs are load generators: they publish `DoTaskCommand`s at a fixed
//! pace for a bounded window, stopping early when their context ends.

use std::time::Duration;

use tracing::{info, warn};

use jobrelay_core::Context;
use jobrelay_events::{DoTaskCommand, MessageBus, Topic};
use jobrelay_infra::{JobRegistryBuilder, PublishError, Publisher};

pub const CRON_SEND_LITTLE_MESSAGE: &str = "CronSendLittleMessage";
pub const SEND_HUGE_MESSAGE: &str = "SendHugeMessage";

/// Pace and window of a periodic publisher job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cadence {
    pub every: Duration,
    pub window: Duration,
}

impl Cadence {
    pub const LITTLE: Cadence = Cadence {
        every: Duration::from_millis(100),
        window: Duration::from_secs(60),
    };

    pub const HUGE: Cadence = Cadence {
        every: Duration::from_millis(10),
        window: Duration::from_secs(10 * 60),
    };
}

/// Register the built-in jobs, publishing through `publisher`.
pub fn register<B>(builder: &mut JobRegistryBuilder, publisher: &Publisher<B>)
where
    B: MessageBus + Clone + 'static,
{
    let little = publisher.clone();
    builder.register(CRON_SEND_LITTLE_MESSAGE, move |ctx| {
        publish_periodically(ctx, &little, Cadence::LITTLE)
    });

    let huge = publisher.clone();
    builder.register(SEND_HUGE_MESSAGE, move |ctx| {
        publish_periodically(ctx, &huge, Cadence::HUGE)
    });
}

/// Publish one `DoTaskCommand` per tick until the window closes.
///
/// Reaching the end of the window is success. Cancellation of the caller's
/// context (shutdown) is reported as an error so the run is recorded as cut short.
pub fn publish_periodically<B: MessageBus>(
    ctx: &Context,
    publisher: &Publisher<B>,
    cadence: Cadence,
) -> anyhow::Result<()> {
    let window = ctx.with_timeout(cadence.window);
    let topic = publisher.topic_name(Topic::DoTask);
    let (mut sent, mut failed) = (0u64, 0u64);

    while window.sleep(cadence.every).is_ok() {
        match publisher.publish(&window, &topic, &DoTaskCommand::new("do task")) {
            Ok(_) => sent += 1,
            Err(PublishError::Cancelled(_)) => break,
            Err(err) => {
                failed += 1;
                warn!(topic = %topic, error = %err, "periodic publish failed");
            }
        }
    }

    info!(topic = %topic, sent, failed, "periodic publishing finished");
    if let Some(reason) = ctx.err() {
        anyhow::bail!("stopped after {sent} messages: {reason}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::CancellationToken;
    use jobrelay_events::{InMemoryMessageBus, SubscriptionConfig};
    use jobrelay_infra::JobRegistry;

    fn publisher() -> Publisher<InMemoryMessageBus> {
        let publisher = Publisher::new(InMemoryMessageBus::new(), "test", "jobrelay");
        publisher.ensure_topics().unwrap();
        let topic = publisher.topic_name(Topic::DoTask);
        publisher
            .bus()
            .create_subscription("probe", &SubscriptionConfig::new(topic))
            .unwrap();
        publisher
    }

    #[test]
    fn both_jobs_are_registered() {
        let mut builder = JobRegistry::builder();
        register(&mut builder, &publisher());
        let registry = builder.build();
        assert_eq!(registry.names(), vec![CRON_SEND_LITTLE_MESSAGE, SEND_HUGE_MESSAGE]);
    }

    #[test]
    fn publishes_once_per_tick_until_the_window_closes() {
        let publisher = publisher();
        let cadence = Cadence {
            every: Duration::from_millis(20),
            window: Duration::from_millis(110),
        };

        publish_periodically(&Context::background(), &publisher, cadence).unwrap();

        let published = publisher.bus().backlog("probe");
        assert!((3..=5).contains(&published), "published {published}");
    }

    #[test]
    fn cancellation_cuts_the_run_short() {
        let publisher = publisher();
        let token = CancellationToken::new();
        let ctx = Context::new(token.clone());
        let cadence = Cadence {
            every: Duration::from_millis(5),
            window: Duration::from_secs(60),
        };

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = std::time::Instant::now();
        let result = publish_periodically(&ctx, &publisher, cadence);
        canceller.join().unwrap();

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(publisher.bus().backlog("probe") > 0);
    }
}
