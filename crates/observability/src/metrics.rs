//! Metrics sinks.
//!
//! Metric names are free text (`cronjob:{job}`, `consumer:{topic}`, ...).
//! Exporters are out of scope; `TracingMetrics` turns samples into `tracing`
//! events on the `metrics` target so they travel with the JSON logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Counter + timing sample API.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str);

    fn timing(&self, name: &str, elapsed: Duration);
}

impl<M> MetricsSink for Arc<M>
where
    M: MetricsSink + ?Sized,
{
    fn incr(&self, name: &str) {
        (**self).incr(name)
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        (**self).timing(name, elapsed)
    }
}

/// Emits every sample as a `tracing` event (target `metrics`).
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr(&self, name: &str) {
        ::tracing::info!(target: "metrics", metric = name, kind = "counter", value = 1u64);
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        ::tracing::info!(
            target: "metrics",
            metric = name,
            kind = "timing",
            elapsed_ms = elapsed.as_millis() as u64
        );
    }
}

/// Records samples in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &str) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(elapsed);
    }
}
