//! Fire-and-forget background cache refresh.
//!
//! `add` enqueues a deferred task without ever blocking the caller. A bounded
//! intake queue feeds a dispatcher thread that hands tasks round-robin to a
//! fixed set of worker lanes. When the intake is full the task is dropped and
//! the drop is logged with the caller's source location.

use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;

use tracing::{debug, error, warn};

use jobrelay_observability::MetricsSink;

/// A deferred refresh task.
pub type RefreshTask = Box<dyn FnOnce() + Send + 'static>;

pub const DROPPED_METRIC: &str = "cacheproc:dropped";

#[derive(Debug, Clone)]
pub struct CacheRefreshConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for CacheRefreshConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 4096,
        }
    }
}

/// Handle to the refresh pipeline. Dropping it stops intake; running tasks finish on their own.
pub struct CacheRefresher {
    intake: Option<SyncSender<RefreshTask>>,
    threads: Vec<thread::JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsSink>,
}

impl CacheRefresher {
    pub fn spawn(config: CacheRefreshConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let workers = config.workers.max(1);
        let (intake_tx, intake_rx) = mpsc::sync_channel::<RefreshTask>(config.queue_capacity);

        let mut lanes = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers + 1);
        for lane in 0..workers {
            let (tx, rx) = mpsc::sync_channel::<RefreshTask>(0);
            lanes.push(tx);
            threads.push(
                thread::Builder::new()
                    .name(format!("cacheproc-{lane}"))
                    .spawn(move || lane_loop(lane, rx))
                    .expect("failed to spawn cache refresh worker"),
            );
        }
        threads.push(
            thread::Builder::new()
                .name("cacheproc-fanout".to_string())
                .spawn(move || fanout_loop(intake_rx, lanes))
                .expect("failed to spawn cache refresh dispatcher"),
        );

        debug!(workers, capacity = config.queue_capacity, "cache refresher started");
        Self {
            intake: Some(intake_tx),
            threads,
            dropped: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    /// Enqueue `task` without blocking. Returns `false` if it was dropped.
    #[track_caller]
    pub fn add<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let caller = Location::caller();
        let Some(intake) = &self.intake else {
            return false;
        };
        match intake.try_send(Box::new(task)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr(DROPPED_METRIC);
                error!(
                    caller_file = caller.file(),
                    caller_line = caller.line(),
                    "cacheproc queue full; dropping refresh task"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(
                    caller_file = caller.file(),
                    caller_line = caller.line(),
                    "cacheproc stopped; dropping refresh task"
                );
                false
            }
        }
    }

    /// Tasks dropped because the intake queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop intake, let queued tasks drain, and join every thread.
    pub fn shutdown(mut self) {
        self.intake.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheRefresher {
    fn drop(&mut self) {
        self.intake.take();
    }
}

fn fanout_loop(intake: Receiver<RefreshTask>, lanes: Vec<SyncSender<RefreshTask>>) {
    for (task, lane) in intake.iter().zip(lanes.iter().cycle()) {
        if lane.send(task).is_err() {
            error!("cache refresh lane closed; stopping dispatcher");
            return;
        }
    }
}

fn lane_loop(lane: usize, tasks: Receiver<RefreshTask>) {
    for task in tasks {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(lane, "cache refresh task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_observability::InMemoryMetrics;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn queued_tasks_run_before_shutdown_returns() {
        let ran = Arc::new(AtomicUsize::new(0));
        let refresher = CacheRefresher::spawn(
            CacheRefreshConfig::default(),
            Arc::new(InMemoryMetrics::new()),
        );
        for _ in 0..100 {
            let ran = ran.clone();
            assert!(refresher.add(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        refresher.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let refresher = CacheRefresher::spawn(
            CacheRefreshConfig {
                workers: 1,
                queue_capacity: 1,
            },
            metrics.clone(),
        );

        // Park the only lane so nothing drains.
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        assert!(refresher.add(move || {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..10 {
            let ran = ran.clone();
            if refresher.add(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        // One task waits in the dispatcher's hand-off, one in the intake.
        assert!(accepted <= 2, "accepted {accepted}");
        assert!(rejected >= 8);
        assert_eq!(refresher.dropped(), rejected);
        assert_eq!(metrics.counter(DROPPED_METRIC), rejected);

        release_tx.send(()).unwrap();
        refresher.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), accepted as usize);
    }

    #[test]
    fn tasks_are_spread_across_lanes() {
        let names = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let refresher = CacheRefresher::spawn(
            CacheRefreshConfig {
                workers: 4,
                queue_capacity: 64,
            },
            Arc::new(InMemoryMetrics::new()),
        );
        for _ in 0..8 {
            let names = names.clone();
            refresher.add(move || {
                let name = thread::current().name().unwrap_or_default().to_string();
                names.lock().unwrap().insert(name);
            });
        }
        refresher.shutdown();

        let names = names.lock().unwrap();
        assert_eq!(names.len(), 4, "{names:?}");
        assert!(names.iter().all(|n| n.starts_with("cacheproc-")));
    }
}
