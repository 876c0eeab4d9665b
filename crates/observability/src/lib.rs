//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Counter and timing sinks keyed by free-text metric names.
pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsSink, TracingMetrics};
