//! Redis-backed key-value store.
//!
//! - `set_nx` is `SET key value NX PX ttl`
//! - compare-and-* operations run as Lua scripts so the ownership check and
//!   the mutation are a single atomic step on the server

use std::sync::LazyLock;
use std::time::Duration;

use tracing::instrument;

use super::{KeyValueStore, StoreError};

static COMPARE_AND_EXPIRE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("pexpire", KEYS[1], ARGV[2])
        end
        return 0
        "#,
    )
});

static COMPARE_AND_DELETE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        end
        return 0
        "#,
    )
});

// -3 marks "not the owner"; -2/-1 are PTTL's own missing/no-expiry codes.
static COMPARE_AND_PTTL: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("pttl", KEYS[1])
        end
        return -3
        "#,
    )
});

#[derive(Debug, Clone)]
pub struct RedisKeyValueStore {
    client: redis::Client,
}

impl RedisKeyValueStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server.
    (ttl.as_millis() as u64).max(1)
}

fn command_error(op: &str) -> impl FnOnce(redis::RedisError) -> StoreError + '_ {
    move |e| StoreError::Command(format!("{op} failed: {e}"))
}

impl KeyValueStore for RedisKeyValueStore {
    #[instrument(skip(self, value), err)]
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query(&mut conn)
            .map_err(command_error("SET NX"))?;
        Ok(reply.is_some())
    }

    fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let reply: i64 = COMPARE_AND_EXPIRE
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke(&mut conn)
            .map_err(command_error("compare-and-expire"))?;
        Ok(reply == 1)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let reply: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(command_error("compare-and-delete"))?;
        Ok(reply == 1)
    }

    fn compare_and_ttl(&self, key: &str, expected: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection()?;
        let reply: i64 = COMPARE_AND_PTTL
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(command_error("compare-and-pttl"))?;
        Ok((reply > 0).then(|| Duration::from_millis(reply as u64)))
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(command_error("GET"))
    }

    fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(command_error("PING"))?;
        Ok(())
    }
}
