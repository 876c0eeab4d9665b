//! Backoff strategies for lock acquisition.
//!
//! Strategies are stateless: the caller passes the 1-based retry number, so
//! one strategy value can be shared by any number of concurrent `obtain`s.

use std::fmt::Debug;
use std::time::Duration;

/// Decides how long to wait before the next acquisition attempt.
pub trait RetryStrategy: Send + Sync + Debug {
    /// Wait before retry number `attempt` (1-based), or `None` to give up.
    ///
    /// A zero duration is treated as giving up as well.
    fn backoff(&self, attempt: u32) -> Option<Duration>;
}

/// Never retry; a contended lock fails on the first attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn backoff(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Retry at a fixed interval until the caller's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff(pub Duration);

impl RetryStrategy for LinearBackoff {
    fn backoff(&self, _attempt: u32) -> Option<Duration> {
        Some(self.0)
    }
}

/// Cap another strategy at `max` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRetry<S> {
    inner: S,
    max: u32,
}

impl<S: RetryStrategy> LimitRetry<S> {
    pub fn new(inner: S, max: u32) -> Self {
        Self { inner, max }
    }
}

impl<S: RetryStrategy> RetryStrategy for LimitRetry<S> {
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max {
            return None;
        }
        self.inner.backoff(attempt)
    }
}

/// Exponential backoff: `2^(attempt+1)` ms, clamped to `[min, max]`.
///
/// The raw value stops growing at 2^26 ms. A zero `max` means no upper clamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    const MAX_SHIFT: u32 = 25;

    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        let shift = attempt.min(Self::MAX_SHIFT);
        let mut wait = Duration::from_millis(2u64 << shift);
        if wait < self.min {
            wait = self.min;
        }
        if !self.max.is_zero() && wait > self.max {
            wait = self.max;
        }
        Some(wait)
    }
}
