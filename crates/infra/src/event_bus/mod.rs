//! Infrastructure message bus implementations.
//!
//! The bus contract and the in-memory bus live in `jobrelay-events`. This
//! module provides the Redis-backed transport used in multi-replica
//! deployments.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBus;
