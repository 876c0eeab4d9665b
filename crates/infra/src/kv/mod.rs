//! Shared key-value store boundary used by the distributed lock.
//!
//! The lock only needs a handful of primitives, each of which must be atomic
//! on the store side:
//! - `set_nx`: set a key with an expiry only if it is absent
//! - `compare_and_*`: act on a key only while it still holds an expected value

use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),
}

/// Atomic primitives over a shared, expiring key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key` with `ttl`, only if `key` is absent.
    ///
    /// Returns `true` when the value was written.
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Reset the expiry of `key` to `ttl` if it currently holds `expected`.
    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete `key` if it currently holds `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Remaining time to live of `key` if it currently holds `expected`.
    ///
    /// `None` when the key holds another value, is gone, or has no expiry.
    fn compare_and_ttl(&self, key: &str, expected: &str) -> Result<Option<Duration>, StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn ping(&self) -> Result<(), StoreError>;
}

impl<S> KeyValueStore for std::sync::Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_nx(key, value, ttl)
    }

    fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_expire(key, expected, ttl)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected)
    }

    fn compare_and_ttl(&self, key: &str, expected: &str) -> Result<Option<Duration>, StoreError> {
        (**self).compare_and_ttl(key, expected)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn ping(&self) -> Result<(), StoreError> {
        (**self).ping()
    }
}
