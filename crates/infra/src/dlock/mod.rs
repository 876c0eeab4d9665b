//! Distributed mutual exclusion over a shared key-value store.
//!
//! A lock is a single key whose value is `token ++ metadata`:
//! - `token`: 22 chars of base64url (16 random bytes), unique per acquisition
//! - `metadata`: optional caller-supplied suffix
//!
//! Ownership is proven by value equality, so refresh/release/ttl only ever
//! touch a key that still holds this holder's value. Expiry is the safety net
//! for crashed holders: a lock is never held past its TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{debug, error, instrument, warn};

use jobrelay_core::Context;

use crate::kv::{KeyValueStore, StoreError};

pub mod retry;

pub use retry::{ExponentialBackoff, LimitRetry, LinearBackoff, NoRetry, RetryStrategy};

const TOKEN_BYTES: usize = 16;
const TOKEN_LEN: usize = 22;

/// Lock key serialising a scheduled job across replicas.
pub fn cron_job_lock(job: &str) -> String {
    format!("lock_cron_job_{job}")
}

/// Lock key serialising work on one order.
pub fn order_lock(order_id: i64) -> String {
    format!("lock_order_{order_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Contention, retries exhausted, deadline passed or context cancelled.
    #[error("lock not obtained")]
    NotObtained,

    /// The key is gone or now belongs to another holder.
    #[error("lock not held")]
    LockNotHeld,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acquisition options: retry behaviour and an optional metadata suffix.
#[derive(Debug, Clone)]
pub struct LockOptions {
    retry: Arc<dyn RetryStrategy>,
    metadata: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry: Arc::new(NoRetry),
            metadata: String::new(),
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn retry(&self) -> &dyn RetryStrategy {
        self.retry.as_ref()
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// Entry point for acquiring locks on a store.
#[derive(Debug)]
pub struct LockClient<S> {
    store: Arc<S>,
}

impl<S> Clone for LockClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KeyValueStore> LockClient<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try to take `key` for `ttl`, retrying per `options` until success or
    /// the attempt deadline.
    ///
    /// The attempt deadline is the context deadline, or `now + ttl` when the
    /// context has none. Running out of retries, reaching the deadline and
    /// cancellation all yield [`LockError::NotObtained`].
    #[instrument(skip(self, ctx, options), fields(trace_id = %ctx.trace_id()))]
    pub fn obtain(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        options: &LockOptions,
    ) -> Result<Lock<S>, LockError> {
        if ctx.is_done() {
            return Err(LockError::NotObtained);
        }

        let value = format!("{}{}", random_token(), options.metadata());
        let ctx = match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.with_deadline(Instant::now() + ttl),
        };

        let mut attempt = 0u32;
        loop {
            if self.store.set_nx(key, &value, ttl)? {
                debug!(key, attempts = attempt + 1, "lock obtained");
                return Ok(Lock {
                    store: self.store.clone(),
                    key: key.to_string(),
                    value,
                });
            }

            attempt += 1;
            let backoff = match options.retry().backoff(attempt) {
                Some(wait) if !wait.is_zero() => wait,
                _ => {
                    debug!(key, attempts = attempt, "lock contended; giving up");
                    return Err(LockError::NotObtained);
                }
            };
            if let Err(reason) = ctx.sleep(backoff) {
                debug!(key, attempts = attempt, %reason, "lock wait aborted");
                return Err(LockError::NotObtained);
            }
        }
    }
}

fn random_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A held lock. Dropping it does not release it; see [`Lock::into_guard`].
#[derive(Debug)]
pub struct Lock<S> {
    store: Arc<S>,
    key: String,
    value: String,
}

impl<S: KeyValueStore> Lock<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The unique ownership token.
    pub fn token(&self) -> &str {
        &self.value[..TOKEN_LEN]
    }

    pub fn metadata(&self) -> &str {
        &self.value[TOKEN_LEN..]
    }

    /// Remaining time to live; zero when the lock has expired or changed hands.
    pub fn ttl(&self) -> Result<Duration, LockError> {
        Ok(self
            .store
            .compare_and_ttl(&self.key, &self.value)?
            .unwrap_or(Duration::ZERO))
    }

    /// Extend the lock to `ttl` from now.
    pub fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        if self.store.compare_and_expire(&self.key, &self.value, ttl)? {
            return Ok(());
        }
        Err(LockError::LockNotHeld)
    }

    /// Delete the key if it is still ours.
    pub fn release(&self) -> Result<(), LockError> {
        if self.store.compare_and_delete(&self.key, &self.value)? {
            debug!(key = %self.key, "lock released");
            return Ok(());
        }
        Err(LockError::LockNotHeld)
    }

    /// Wrap the lock so it is released on every exit path.
    pub fn into_guard(self) -> LockGuard<S> {
        LockGuard { lock: Some(self) }
    }
}

/// Releases its lock when dropped. Release failures are logged, not raised.
#[derive(Debug)]
pub struct LockGuard<S: KeyValueStore> {
    lock: Option<Lock<S>>,
}

impl<S: KeyValueStore> LockGuard<S> {
    /// Release now and report the outcome.
    pub fn release(mut self) -> Result<(), LockError> {
        match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }
}

impl<S: KeyValueStore> std::ops::Deref for LockGuard<S> {
    type Target = Lock<S>;

    fn deref(&self) -> &Lock<S> {
        // Only `release(self)` empties the slot, and it consumes the guard.
        self.lock.as_ref().unwrap_or_else(|| unreachable!("lock guard already released"))
    }
}

impl<S: KeyValueStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match lock.release() {
            Ok(()) => {}
            Err(LockError::LockNotHeld) => {
                warn!(key = %lock.key, "lock expired before release");
            }
            Err(err) => {
                error!(key = %lock.key, error = %err, "lock release failed");
            }
        }
    }
}
