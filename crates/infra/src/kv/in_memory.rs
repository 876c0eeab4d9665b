use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{KeyValueStore, StoreError};

/// In-process expiring key-value store (tests/dev, single-replica runs).
///
/// Expired entries are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live entry under `key` holding `expected`.
    fn owned<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        expected: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key).filter(|e| e.value == expected)
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        Ok(match Self::owned(&mut entries, key, expected, now) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                true
            }
            None => false,
        })
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if Self::owned(&mut entries, key, expected, now).is_none() {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    fn compare_and_ttl(&self, key: &str, expected: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        Ok(Self::owned(&mut entries, key, expected, now)
            .map(|e| e.expires_at.saturating_duration_since(now))
            .filter(|d| !d.is_zero()))
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn set_nx_only_writes_absent_keys() {
        let store = InMemoryKeyValueStore::new();
        assert!(store.set_nx("k", "a", TTL).unwrap());
        assert!(!store.set_nx("k", "b", TTL).unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn expired_keys_can_be_taken_again() {
        let store = InMemoryKeyValueStore::new();
        assert!(store.set_nx("k", "a", Duration::from_millis(20)).unwrap());
        thread::sleep(Duration::from_millis(40));

        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.compare_and_delete("k", "a").unwrap());
        assert!(store.set_nx("k", "b", TTL).unwrap());
    }

    #[test]
    fn compare_operations_ignore_foreign_values() {
        let store = InMemoryKeyValueStore::new();
        store.set_nx("k", "mine", TTL).unwrap();

        assert!(!store.compare_and_expire("k", "other", TTL).unwrap());
        assert_eq!(store.compare_and_ttl("k", "other").unwrap(), None);
        assert!(!store.compare_and_delete("k", "other").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("mine"));

        assert!(store.compare_and_ttl("k", "mine").unwrap().is_some());
        assert!(store.compare_and_delete("k", "mine").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn compare_and_expire_moves_the_deadline() {
        let store = InMemoryKeyValueStore::new();
        store.set_nx("k", "v", Duration::from_millis(50)).unwrap();
        assert!(store.compare_and_expire("k", "v", TTL).unwrap());

        let ttl = store.compare_and_ttl("k", "v").unwrap().unwrap();
        assert!(ttl > Duration::from_secs(9));
    }
}
