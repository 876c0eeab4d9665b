//! Infrastructure layer: locking, dispatch, fan-out, publishing and the
//! Redis-backed adapters behind them.

pub mod cache_refresh;
pub mod config;
pub mod dispatcher;
pub mod distributor;
pub mod dlock;
pub mod event_bus;
pub mod kv;
pub mod publisher;
pub mod registry;
pub mod subscriber;


pub use cache_refresh::{CacheRefreshConfig, CacheRefresher};
pub use config::{ConfigError, ServiceConfig};
pub use dispatcher::{DispatchError, DispatchOutcome, DispatcherConfig, TriggerDispatcher};
pub use distributor::distribute;
pub use dlock::{Lock, LockClient, LockError, LockGuard, LockOptions};
pub use kv::{InMemoryKeyValueStore, KeyValueStore, StoreError};
pub use publisher::{PublishError, Publisher};
pub use registry::{JobHandler, JobRegistry, JobRegistryBuilder, RegistryCell, UnknownJob};
pub use subscriber::{RunnerConfig, SubscriptionError, SubscriptionHandle, SubscriptionRunner};
