//! Backend selection and long-lived service wiring.
//!
//! With `REDIS_URL` set (and the `redis` feature on) locks and the bus live
//! in Redis; otherwise every replica is a single process with in-memory
//! backends, which is what tests and local runs use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{error, info};

use jobrelay_core::{CancellationToken, Context};
use jobrelay_events::{
    DeadLetterPolicy, InMemoryMessageBus, Message, MessageBus, SubscriptionConfig, Topic,
};
use jobrelay_infra::{
    CacheRefresher, InMemoryKeyValueStore, JobRegistry, KeyValueStore, LockClient, Publisher,
    RegistryCell, ServiceConfig, StoreError, SubscriptionError, SubscriptionHandle,
    SubscriptionRunner, TriggerDispatcher,
};
use jobrelay_observability::{MetricsSink, TracingMetrics};

#[cfg(feature = "redis")]
use jobrelay_infra::{event_bus::RedisStreamsBus, kv::RedisKeyValueStore};

use crate::consumers::{Consumers, RecentTasks};
use crate::jobs;

pub type SharedBus = Arc<dyn MessageBus>;
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Delivery attempts on the small-task topic before a message is dead-lettered.
pub const SMALL_TASK_MAX_DELIVERY_ATTEMPTS: u32 = 5;

const RECENT_TASKS: usize = 100;

pub struct AppServices {
    config: ServiceConfig,
    publisher: Publisher<SharedBus>,
    store: SharedStore,
    metrics: Arc<dyn MetricsSink>,
    jobs: RegistryCell,
    cache: Arc<CacheRefresher>,
    recent: Arc<RecentTasks>,
    shutdown: CancellationToken,
}

impl AppServices {
    pub fn new(
        config: ServiceConfig,
        bus: SharedBus,
        store: SharedStore,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let publisher = Publisher::new(bus, config.deploy_env.clone(), config.app_id.clone());
        let cache = Arc::new(CacheRefresher::spawn(config.cache_refresh(), metrics.clone()));
        Self {
            config,
            publisher,
            store,
            metrics,
            jobs: RegistryCell::new(),
            cache,
            recent: Arc::new(RecentTasks::new(RECENT_TASKS)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher<SharedBus> {
        &self.publisher
    }

    pub fn cache(&self) -> &CacheRefresher {
        &self.cache
    }

    pub fn recent_tasks(&self) -> &RecentTasks {
        &self.recent
    }

    /// Cancelled on process shutdown; every subscription loop and running job observes it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The job registry, built on first use.
    pub fn registry(&self) -> Arc<JobRegistry> {
        self.jobs
            .initialize(|builder| jobs::register(builder, &self.publisher))
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.store.ping()
    }

    /// Ask the fleet to run `job` once; returns the trigger's message id.
    pub fn trigger_job(&self, job: &str) -> Result<String, jobrelay_infra::PublishError> {
        let ctx = Context::new(self.shutdown.clone()).with_timeout(Duration::from_secs(10));
        self.publisher.trigger_job(&ctx, job)
    }

    pub fn dispatcher(&self) -> TriggerDispatcher<SharedStore> {
        TriggerDispatcher::new(
            self.registry(),
            LockClient::new(Arc::new(self.store.clone())),
            self.metrics.clone(),
            self.config.dispatcher(),
        )
    }

    /// Start the trigger, work and dead-letter subscriptions.
    pub fn start_subscriptions(&self) -> Subscriptions {
        let consumers = Consumers::new(
            self.metrics.clone(),
            self.cache.clone(),
            self.recent.clone(),
            self.config.deploy_env.clone(),
        );
        let dead_letter = DeadLetterPolicy::new(
            self.publisher.topic_name(Topic::DeadLetter),
            SMALL_TASK_MAX_DELIVERY_ATTEMPTS,
        );

        let dispatcher = self.dispatcher();
        let mut handles = vec![self.subscribe(Topic::Trigger, None, move |ctx, msg| {
            dispatcher.handle(ctx, &msg);
        })];

        let c = consumers.clone();
        handles.push(self.subscribe(Topic::DoTask, None, move |ctx, msg| c.do_task(ctx, msg)));

        let c = consumers.clone();
        handles.push(self.subscribe(Topic::DoSmallTask, Some(dead_letter), move |ctx, msg| {
            c.do_small_task(ctx, msg)
        }));

        handles.push(self.subscribe(Topic::DeadLetter, None, move |ctx, msg| {
            consumers.dead_letter(ctx, msg)
        }));

        info!(count = handles.len(), "subscriptions started");
        Subscriptions {
            handles,
            shutdown: self.shutdown.clone(),
        }
    }

    fn subscribe<H>(
        &self,
        topic: Topic,
        dead_letter: Option<DeadLetterPolicy>,
        handler: H,
    ) -> SubscriptionHandle
    where
        H: Fn(&Context, Message) + Send + 'static,
    {
        let mut config = SubscriptionConfig::new(self.publisher.topic_name(topic));
        if let Some(policy) = dead_letter {
            config = config.with_dead_letter(policy);
        }
        SubscriptionRunner::spawn(
            self.publisher.bus().clone(),
            self.publisher.subscription_name(topic),
            config,
            self.config.runner(),
            self.shutdown.clone(),
            handler,
        )
    }
}

/// The running subscription loops.
#[derive(Debug)]
pub struct Subscriptions {
    handles: Vec<SubscriptionHandle>,
    shutdown: CancellationToken,
}

impl Subscriptions {
    /// Block until a loop fails or shutdown is requested.
    ///
    /// Returns the first loop failure; after shutdown, waits for every loop to stop.
    pub fn supervise(mut self) -> Result<(), SubscriptionError> {
        loop {
            if self.shutdown.wait_timeout(Duration::from_millis(500)) {
                return self.join_all();
            }
            if let Some(i) = self.handles.iter().position(SubscriptionHandle::is_finished) {
                let handle = self.handles.swap_remove(i);
                let subscription = handle.subscription().to_string();
                if let Err(err) = handle.join() {
                    error!(subscription = %subscription, error = %err, "subscription stopped");
                    return Err(err);
                }
            }
            if self.handles.is_empty() {
                return Ok(());
            }
        }
    }

    fn join_all(self) -> Result<(), SubscriptionError> {
        let mut first = Ok(());
        for handle in self.handles {
            let result = handle.join();
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}

/// Choose backends from `config`, ensure every topic exists and wire the services.
pub fn build_services(config: ServiceConfig) -> anyhow::Result<AppServices> {
    let (bus, store) = backends(&config)?;
    let services = AppServices::new(config, bus, store, Arc::new(TracingMetrics));
    services
        .publisher()
        .ensure_topics()
        .context("failed to ensure topics")?;
    Ok(services)
}

fn backends(config: &ServiceConfig) -> anyhow::Result<(SharedBus, SharedStore)> {
    match config.redis_url.as_deref() {
        None => {
            info!("REDIS_URL not set; using in-memory bus and store");
            Ok((
                Arc::new(InMemoryMessageBus::new()),
                Arc::new(InMemoryKeyValueStore::new()),
            ))
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            let bus = RedisStreamsBus::new(url).context("failed to create redis bus")?;
            let store = RedisKeyValueStore::new(url).context("failed to create redis store")?;
            store.ping().context("redis is unreachable")?;
            info!("using redis bus and store");
            Ok((Arc::new(bus), Arc::new(store)))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("REDIS_URL is set but this build has no redis support"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_observability::InMemoryMetrics;

    fn in_memory() -> (AppServices, Arc<InMemoryMessageBus>, Arc<InMemoryMetrics>) {
        let bus = Arc::new(InMemoryMessageBus::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = ServiceConfig {
            deploy_env: "test".to_string(),
            subscription_retry_delay: Duration::from_millis(10),
            ..ServiceConfig::default()
        };
        let services = AppServices::new(
            config,
            bus.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            metrics.clone(),
        );
        services.publisher().ensure_topics().unwrap();
        (services, bus, metrics)
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn registry_is_built_once_with_the_builtin_jobs() {
        let (services, _, _) = in_memory();
        let first = services.registry();
        let second = services.registry();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.contains(jobs::CRON_SEND_LITTLE_MESSAGE));
        assert!(first.contains(jobs::SEND_HUGE_MESSAGE));
    }

    #[test]
    fn subscriptions_cover_every_topic() {
        let (services, bus, _) = in_memory();
        let subscriptions = services.start_subscriptions();

        for topic in Topic::ALL {
            let name = services.publisher().subscription_name(topic);
            assert!(
                eventually(|| bus.subscription_exists(&name).unwrap()),
                "{name} was never created"
            );
        }

        services.shutdown_token().cancel();
        subscriptions.supervise().unwrap();
    }

    #[test]
    fn small_tasks_are_consumed() {
        let (services, _, metrics) = in_memory();
        let subscriptions = services.start_subscriptions();
        let small = services.publisher().subscription_name(Topic::DoSmallTask);
        assert!(eventually(|| services
            .publisher()
            .bus()
            .subscription_exists(&small)
            .unwrap()));

        services
            .publisher()
            .publish_to(
                &Context::background(),
                Topic::DoSmallTask,
                &jobrelay_events::DoSmallTaskCommand::new("tiny"),
            )
            .unwrap();

        assert!(eventually(|| metrics.counter("consumer:test-do-small-task-send") == 1));
        assert!(eventually(|| services.recent_tasks().snapshot() == vec!["tiny".to_string()]));

        services.shutdown_token().cancel();
        subscriptions.supervise().unwrap();
    }

    #[test]
    fn unknown_triggers_are_discarded_without_stopping_the_loop() {
        let (services, bus, metrics) = in_memory();
        let subscriptions = services.start_subscriptions();
        let trigger = services.publisher().subscription_name(Topic::Trigger);
        assert!(eventually(|| bus.subscription_exists(&trigger).unwrap()));

        services.trigger_job("NoSuchJob").unwrap();
        assert!(eventually(|| bus.backlog(&trigger) == 0 && bus.in_flight(&trigger) == 0));
        assert_eq!(metrics.counter("cronjob:NoSuchJob"), 0);

        services.shutdown_token().cancel();
        subscriptions.supervise().unwrap();
    }
}
