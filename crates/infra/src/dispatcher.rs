//! Trigger dispatcher: turns a trigger message into at most one concurrent run
//! of the named job across all replicas.
//!
//! Per message:
//! 1. decode the trigger (malformed → ack and discard)
//! 2. resolve the job (unknown → ack and discard)
//! 3. ack, then take the job's cluster-wide lock (contended → skip)
//! 4. run the handler, release the lock, emit `cronjob:{job}` metrics
//!
//! The message is acked before the job runs: a replica that dies mid-job does
//! not cause a redelivery.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use jobrelay_core::Context;
use jobrelay_events::{Message, TriggerCommand};
use jobrelay_observability::MetricsSink;

use crate::dlock::{self, LockClient, LockError, LockOptions};
use crate::kv::KeyValueStore;
use crate::registry::{JobHandler, JobRegistry, UnknownJob};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// TTL of the per-job lock; no retry, contention means skip.
    pub lock_ttl: Duration,
    /// Runs longer than this are logged as slow.
    pub slow_threshold: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            slow_threshold: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed trigger payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownJob(#[from] UnknownJob),

    #[error("job lock unavailable: {0}")]
    Lock(#[from] LockError),

    #[error("job failed: {0:#}")]
    Handler(anyhow::Error),
}

/// What happened to one trigger message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Acked without running anything (decode failure or unknown job).
    Discarded(DispatchError),
    /// Another holder had the job lock, or the lock store failed.
    Skipped { job: String, reason: DispatchError },
    Completed {
        job: String,
        elapsed: Duration,
        slow: bool,
    },
    Failed {
        job: String,
        elapsed: Duration,
        slow: bool,
        error: DispatchError,
    },
}

impl DispatchOutcome {
    pub fn job(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Discarded(_) => None,
            DispatchOutcome::Skipped { job, .. }
            | DispatchOutcome::Completed { job, .. }
            | DispatchOutcome::Failed { job, .. } => Some(job),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

enum Run {
    Skipped(LockError),
    Finished(anyhow::Result<()>),
}

pub struct TriggerDispatcher<S> {
    registry: Arc<JobRegistry>,
    locks: LockClient<S>,
    metrics: Arc<dyn MetricsSink>,
    config: DispatcherConfig,
}

impl<S: KeyValueStore> TriggerDispatcher<S> {
    pub fn new(
        registry: Arc<JobRegistry>,
        locks: LockClient<S>,
        metrics: Arc<dyn MetricsSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            locks,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Handle one trigger message. Never panics and never leaves the message unsettled.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), message_id = %msg.id()))]
    pub fn handle(&self, ctx: &Context, msg: &Message) -> DispatchOutcome {
        let cmd: TriggerCommand = match serde_json::from_slice(msg.data()) {
            Ok(cmd) => cmd,
            Err(err) => {
                error!(error = %err, "trigger payload is not a job command; discarding");
                msg.ack();
                return DispatchOutcome::Discarded(err.into());
            }
        };
        info!(job = %cmd.job, trigger_time = cmd.trigger_time, "trigger received");

        let handler = match self.registry.resolve(&cmd.job) {
            Ok(handler) => handler,
            Err(err) => {
                error!(job = %cmd.job, "no handler registered for job; discarding");
                msg.ack();
                return DispatchOutcome::Discarded(err.into());
            }
        };
        msg.ack();

        let started = Instant::now();
        let run = self.run_exclusive(ctx, &cmd.job, &handler);
        let elapsed = started.elapsed();

        let metric = format!("cronjob:{}", cmd.job);
        self.metrics.timing(&metric, elapsed);
        self.metrics.incr(&metric);

        let slow = elapsed > self.config.slow_threshold;
        if slow {
            warn!(
                job = %cmd.job,
                elapsed_secs = elapsed.as_secs(),
                threshold_secs = self.config.slow_threshold.as_secs(),
                "job duration too long"
            );
        }

        let job = cmd.job;
        match run {
            Run::Skipped(err) => DispatchOutcome::Skipped {
                job,
                reason: err.into(),
            },
            Run::Finished(Ok(())) => {
                info!(job = %job, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                DispatchOutcome::Completed { job, elapsed, slow }
            }
            Run::Finished(Err(err)) => {
                error!(job = %job, error = %format!("{err:#}"), "job failed");
                DispatchOutcome::Failed {
                    job,
                    elapsed,
                    slow,
                    error: DispatchError::Handler(err),
                }
            }
        }
    }

    fn run_exclusive(&self, ctx: &Context, job: &str, handler: &JobHandler) -> Run {
        let key = dlock::cron_job_lock(job);
        let guard = match self
            .locks
            .obtain(ctx, &key, self.config.lock_ttl, &LockOptions::default())
        {
            Ok(lock) => lock.into_guard(),
            Err(err) => {
                match &err {
                    LockError::NotObtained => {
                        info!(job, key = %key, "job already running elsewhere; skipping")
                    }
                    other => error!(job, key = %key, error = %other, "job lock failed; skipping"),
                }
                return Run::Skipped(err);
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler(ctx)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("job handler panicked")));
        drop(guard);
        Run::Finished(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;
    use jobrelay_events::{
        InMemoryMessageBus, MessageBus, ReceiveSettings, SubscriptionConfig,
    };
    use jobrelay_observability::InMemoryMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct Fixture {
        store: Arc<InMemoryKeyValueStore>,
        metrics: Arc<InMemoryMetrics>,
        runs: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryKeyValueStore::new()),
                metrics: Arc::new(InMemoryMetrics::new()),
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn dispatcher(
            &self,
            config: DispatcherConfig,
            setup: impl FnOnce(&mut crate::registry::JobRegistryBuilder, Arc<AtomicUsize>),
        ) -> TriggerDispatcher<InMemoryKeyValueStore> {
            let mut builder = JobRegistry::builder();
            setup(&mut builder, self.runs.clone());
            TriggerDispatcher::new(
                Arc::new(builder.build()),
                LockClient::new(self.store.clone()),
                self.metrics.clone(),
                config,
            )
        }

        fn counting(&self) -> TriggerDispatcher<InMemoryKeyValueStore> {
            self.dispatcher(DispatcherConfig::default(), |b, runs| {
                b.register("J", move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            })
        }
    }

    /// A message delivered through the in-memory bus so ack/nack are observable.
    fn delivered(payload: &[u8]) -> (InMemoryMessageBus, Message) {
        let bus = InMemoryMessageBus::new();
        bus.create_topic("t").unwrap();
        bus.create_subscription("t.sub", &SubscriptionConfig::new("t"))
            .unwrap();
        let sub = bus.subscribe("t.sub", &ReceiveSettings::default()).unwrap();
        bus.publish("t", payload.to_vec()).unwrap();
        let msg = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        (bus, msg)
    }

    fn trigger(job: &str) -> Vec<u8> {
        serde_json::to_vec(&TriggerCommand::new(job, 1_700_000_000)).unwrap()
    }

    #[test]
    fn runs_the_job_and_releases_its_lock() {
        let fx = Fixture::new();
        let dispatcher = fx.counting();
        let (bus, msg) = delivered(&trigger("J"));

        let outcome = dispatcher.handle(&Context::background(), &msg);

        assert!(outcome.is_completed(), "{outcome:?}");
        assert!(msg.is_settled());
        assert_eq!(bus.in_flight("t.sub"), 0);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.get(&dlock::cron_job_lock("J")).unwrap(), None);
        assert_eq!(fx.metrics.counter("cronjob:J"), 1);
        assert_eq!(fx.metrics.timings("cronjob:J").len(), 1);
    }

    #[test]
    fn cron_send_little_message_holds_its_lock_while_running() {
        let fx = Fixture::new();
        let store = fx.store.clone();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let dispatcher = {
            let seen = seen.clone();
            fx.dispatcher(DispatcherConfig::default(), move |b, runs| {
                b.register("CronSendLittleMessage", move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    *seen.lock().unwrap() =
                        store.get("lock_cron_job_CronSendLittleMessage").unwrap();
                    Ok(())
                });
            })
        };
        let (bus, msg) = delivered(br#"{"job":"CronSendLittleMessage"}"#);

        let outcome = dispatcher.handle(&Context::background(), &msg);

        assert!(outcome.is_completed(), "{outcome:?}");
        assert_eq!(outcome.job(), Some("CronSendLittleMessage"));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        let held = seen.lock().unwrap().take();
        assert!(held.is_some(), "lock was not held during the run");
        assert_eq!(
            fx.store.get("lock_cron_job_CronSendLittleMessage").unwrap(),
            None
        );
        assert_eq!(fx.metrics.counter("cronjob:CronSendLittleMessage"), 1);
        assert_eq!(fx.metrics.timings("cronjob:CronSendLittleMessage").len(), 1);
        drop(msg);
        assert_eq!(bus.in_flight("t.sub"), 0);
    }

    #[test]
    fn trigger_without_trigger_time_still_resolves() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(DispatcherConfig::default(), |b, runs| {
            b.register("CronSendLittleMessage", move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        });

        let unknown = dispatcher.handle(
            &Context::background(),
            &Message::detached("1", br#"{"job":"DoesNotExist"}"#.to_vec()),
        );
        assert!(
            matches!(unknown, DispatchOutcome::Discarded(DispatchError::UnknownJob(_))),
            "{unknown:?}"
        );
        assert_eq!(fx.store.get("lock_cron_job_DoesNotExist").unwrap(), None);
        assert_eq!(fx.metrics.counter("cronjob:DoesNotExist"), 0);

        let known = dispatcher.handle(
            &Context::background(),
            &Message::detached("2", br#"{"job":"CronSendLittleMessage"}"#.to_vec()),
        );
        assert!(known.is_completed(), "{known:?}");
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contended_job_is_skipped_but_still_measured() {
        let fx = Fixture::new();
        let dispatcher = fx.counting();
        fx.store
            .set_nx(&dlock::cron_job_lock("J"), "someone-else", Duration::from_secs(30))
            .unwrap();

        let outcome = dispatcher.handle(&Context::background(), &Message::detached("1", trigger("J")));

        assert!(matches!(
            outcome,
            DispatchOutcome::Skipped { reason: DispatchError::Lock(LockError::NotObtained), .. }
        ));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            fx.store.get(&dlock::cron_job_lock("J")).unwrap().as_deref(),
            Some("someone-else")
        );
        assert_eq!(fx.metrics.counter("cronjob:J"), 1);
    }

    #[test]
    fn unknown_job_is_acked_and_discarded() {
        let fx = Fixture::new();
        let dispatcher = fx.counting();
        let (bus, msg) = delivered(br#"{"job":"DoesNotExist"}"#);

        let outcome = dispatcher.handle(&Context::background(), &msg);

        assert!(matches!(outcome, DispatchOutcome::Discarded(DispatchError::UnknownJob(_))));
        assert!(msg.is_settled());
        drop(msg);
        assert_eq!(bus.in_flight("t.sub"), 0);
        assert_eq!(fx.metrics.counter("cronjob:DoesNotExist"), 0);
        assert_eq!(fx.store.get(&dlock::cron_job_lock("DoesNotExist")).unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_acked_and_discarded() {
        let fx = Fixture::new();
        let dispatcher = fx.counting();
        let (bus, msg) = delivered(b"not json");

        let outcome = dispatcher.handle(&Context::background(), &msg);

        assert!(matches!(outcome, DispatchOutcome::Discarded(DispatchError::Decode(_))));
        drop(msg);
        assert_eq!(bus.in_flight("t.sub"), 0);
        assert_eq!(bus.backlog("t.sub"), 0);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_and_panicking_handlers_release_the_lock() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(DispatcherConfig::default(), |b, _| {
            b.register("Fails", |_| anyhow::bail!("downstream unavailable"));
            b.register("Panics", |_| panic!("handler bug"));
        });

        for job in ["Fails", "Panics"] {
            let outcome =
                dispatcher.handle(&Context::background(), &Message::detached("1", trigger(job)));
            assert!(
                matches!(outcome, DispatchOutcome::Failed { error: DispatchError::Handler(_), .. }),
                "{job}: {outcome:?}"
            );
            assert_eq!(fx.store.get(&dlock::cron_job_lock(job)).unwrap(), None);
            assert_eq!(fx.metrics.counter(&format!("cronjob:{job}")), 1);
        }
    }

    #[test]
    fn slow_jobs_are_flagged() {
        let fx = Fixture::new();
        let config = DispatcherConfig {
            slow_threshold: Duration::from_millis(10),
            ..DispatcherConfig::default()
        };
        let dispatcher = fx.dispatcher(config, |b, _| {
            b.register("Slow", |_| {
                thread::sleep(Duration::from_millis(30));
                Ok(())
            });
        });

        let outcome = dispatcher.handle(&Context::background(), &Message::detached("1", trigger("Slow")));

        match outcome {
            DispatchOutcome::Completed { slow, elapsed, .. } => {
                assert!(slow);
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn concurrent_triggers_run_the_job_once() {
        let fx = Fixture::new();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let finish_rx = std::sync::Mutex::new(finish_rx);
        let dispatcher = Arc::new(fx.dispatcher(DispatcherConfig::default(), move |b, runs| {
            let started_tx = std::sync::Mutex::new(started_tx);
            b.register("J", move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.lock().unwrap().send(());
                let _ = finish_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                Ok(())
            });
        }));

        let first = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                dispatcher.handle(&Context::background(), &Message::detached("1", trigger("J")))
            })
        };
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let second =
            dispatcher.handle(&Context::background(), &Message::detached("2", trigger("J")));
        finish_tx.send(()).unwrap();
        let first = first.join().unwrap();

        assert!(first.is_completed());
        assert!(matches!(second, DispatchOutcome::Skipped { .. }));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
    }
}
