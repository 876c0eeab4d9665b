//! Consumers for the work topics and the dead-letter topic.
//!
//! Every consumer acknowledges what it receives, including payloads it cannot
//! decode, and records `consumer:{topic}` count and latency under the
//! environment-scoped topic name, e.g. `consumer:uat-do-task`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::de::DeserializeOwned;
use tracing::{error, info};

use jobrelay_core::Context;
use jobrelay_events::{DoSmallTaskCommand, DoTaskCommand, Message, Topic};
use jobrelay_infra::CacheRefresher;
use jobrelay_observability::MetricsSink;

/// Names of the most recently consumed tasks, newest last.
#[derive(Debug)]
pub struct RecentTasks {
    capacity: usize,
    tasks: Mutex<VecDeque<String>>,
}

impl RecentTasks {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, name: String) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.len() == self.capacity {
            tasks.pop_front();
        }
        tasks.push_back(name);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Shared collaborators of the consumers.
#[derive(Clone)]
pub struct Consumers {
    metrics: Arc<dyn MetricsSink>,
    cache: Arc<CacheRefresher>,
    recent: Arc<RecentTasks>,
    deploy_env: String,
}

impl Consumers {
    pub fn new(
        metrics: Arc<dyn MetricsSink>,
        cache: Arc<CacheRefresher>,
        recent: Arc<RecentTasks>,
        deploy_env: impl Into<String>,
    ) -> Self {
        Self {
            metrics,
            cache,
            recent,
            deploy_env: deploy_env.into(),
        }
    }

    pub fn do_task(&self, ctx: &Context, msg: Message) {
        self.consume(Topic::DoTask, msg, |cmd: DoTaskCommand| {
            info!(trace_id = %ctx.trace_id(), task = %cmd.name, "doing task");
            self.remember(cmd.name);
        });
    }

    pub fn do_small_task(&self, ctx: &Context, msg: Message) {
        self.consume(Topic::DoSmallTask, msg, |cmd: DoSmallTaskCommand| {
            info!(trace_id = %ctx.trace_id(), task = %cmd.name, "doing small task");
            self.remember(cmd.name);
        });
    }

    pub fn dead_letter(&self, ctx: &Context, msg: Message) {
        let started = Instant::now();
        error!(
            trace_id = %ctx.trace_id(),
            message_id = %msg.id(),
            data = %String::from_utf8_lossy(msg.data()),
            "dead letter"
        );
        msg.ack();
        self.record(Topic::DeadLetter, started);
    }

    fn consume<T, F>(&self, topic: Topic, msg: Message, handle: F)
    where
        T: DeserializeOwned,
        F: FnOnce(T),
    {
        let started = Instant::now();
        match serde_json::from_slice::<T>(msg.data()) {
            Ok(cmd) => handle(cmd),
            Err(err) => error!(%topic, message_id = %msg.id(), error = %err, "undecodable message"),
        }
        msg.ack();
        self.record(topic, started);
    }

    /// Off the consumer path; dropped when the refresh queue is full.
    fn remember(&self, name: String) {
        let recent = self.recent.clone();
        self.cache.add(move || recent.record(name));
    }

    fn record(&self, topic: Topic, started: Instant) {
        let metric = format!("consumer:{}", topic.name(&self.deploy_env));
        self.metrics.timing(&metric, started.elapsed());
        self.metrics.incr(&metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_events::Acker;
    use jobrelay_infra::CacheRefreshConfig;
    use jobrelay_observability::InMemoryMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    impl Acker for Recorder {
        fn ack(&self, _id: &str) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn nack(&self, _id: &str) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture() -> (Consumers, Arc<InMemoryMetrics>, Arc<RecentTasks>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let cache = Arc::new(CacheRefresher::spawn(
            CacheRefreshConfig::default(),
            metrics.clone(),
        ));
        let recent = Arc::new(RecentTasks::new(8));
        (
            Consumers::new(metrics.clone(), cache, recent.clone(), "uat"),
            metrics,
            recent,
        )
    }

    fn message(data: &[u8], acker: &Arc<Recorder>) -> Message {
        Message::new("m-1", data.to_vec(), 1, acker.clone())
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn do_task_acks_and_remembers_the_task() {
        let (consumers, metrics, recent) = fixture();
        let acker = Arc::new(Recorder::default());

        consumers.do_task(&Context::background(), message(br#"{"name":"do task"}"#, &acker));

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter("consumer:uat-do-task"), 1);
        assert!(eventually(|| recent.snapshot() == vec!["do task".to_string()]));
    }

    #[test]
    fn undecodable_payloads_are_acked_anyway() {
        let (consumers, metrics, recent) = fixture();
        let acker = Arc::new(Recorder::default());

        consumers.do_small_task(&Context::background(), message(b"not json", &acker));

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.nacks.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.counter("consumer:uat-do-small-task-send"), 1);
        assert!(recent.snapshot().is_empty());
    }

    #[test]
    fn dead_letters_are_acked_and_counted() {
        let (consumers, metrics, _) = fixture();
        let acker = Arc::new(Recorder::default());

        consumers.dead_letter(&Context::background(), message(b"\xff\xfe", &acker));

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter("consumer:uat-deadletter"), 1);
        assert_eq!(metrics.timings("consumer:uat-deadletter").len(), 1);
    }

    #[test]
    fn metrics_follow_the_deploy_environment() {
        let (_, metrics, recent) = fixture();
        let cache = Arc::new(CacheRefresher::spawn(
            CacheRefreshConfig::default(),
            metrics.clone(),
        ));
        let prod = Consumers::new(metrics.clone(), cache, recent, "prod");
        let acker = Arc::new(Recorder::default());

        prod.do_task(&Context::background(), message(br#"{"name":"x"}"#, &acker));

        assert_eq!(metrics.counter("consumer:prod-do-task"), 1);
        assert_eq!(metrics.counter("consumer:uat-do-task"), 0);
        assert_eq!(metrics.counter("consumer:do-task"), 0);
    }

    #[test]
    fn recent_tasks_keep_only_the_newest() {
        let recent = RecentTasks::new(2);
        for name in ["a", "b", "c"] {
            recent.record(name.to_string());
        }
        assert_eq!(recent.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }
}
