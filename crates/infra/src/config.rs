//! Service configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use jobrelay_events::ReceiveSettings;

use crate::cache_refresh::CacheRefreshConfig;
use crate::dispatcher::DispatcherConfig;
use crate::subscriber::RunnerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Prefix of every topic name (`DEPLOY_ENV`).
    pub deploy_env: String,
    /// Suffix of every subscription id (`APP_ID`).
    pub app_id: String,
    /// Shared Redis for locks and the bus; in-process backends when unset.
    pub redis_url: Option<String>,
    pub http_addr: String,
    pub lock_ttl: Duration,
    pub slow_job_threshold: Duration,
    pub subscription_max_failures: u32,
    pub subscription_retry_delay: Duration,
    pub cache_workers: usize,
    pub cache_queue_capacity: usize,
    pub max_outstanding_messages: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            deploy_env: "uat".to_string(),
            app_id: "jobrelay".to_string(),
            redis_url: None,
            http_addr: "0.0.0.0:8000".to_string(),
            lock_ttl: Duration::from_secs(30),
            slow_job_threshold: Duration::from_secs(60),
            subscription_max_failures: 10,
            subscription_retry_delay: Duration::from_millis(2000),
            cache_workers: 4,
            cache_queue_capacity: 4096,
            max_outstanding_messages: 1,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let d = Self::default();

        Ok(Self {
            deploy_env: get("DEPLOY_ENV").unwrap_or(d.deploy_env),
            app_id: get("APP_ID").unwrap_or(d.app_id),
            redis_url: get("REDIS_URL"),
            http_addr: get("HTTP_ADDR").unwrap_or(d.http_addr),
            lock_ttl: Duration::from_secs(positive(&get, "LOCK_TTL_SECS", d.lock_ttl.as_secs())?),
            slow_job_threshold: Duration::from_secs(positive(
                &get,
                "SLOW_JOB_SECS",
                d.slow_job_threshold.as_secs(),
            )?),
            subscription_max_failures: parse(
                &get,
                "SUBSCRIPTION_MAX_FAILURES",
                d.subscription_max_failures,
            )?,
            subscription_retry_delay: Duration::from_millis(parse(
                &get,
                "SUBSCRIPTION_RETRY_DELAY_MS",
                d.subscription_retry_delay.as_millis() as u64,
            )?),
            cache_workers: positive(&get, "CACHE_WORKERS", d.cache_workers)?,
            cache_queue_capacity: positive(&get, "CACHE_QUEUE_CAPACITY", d.cache_queue_capacity)?,
            max_outstanding_messages: positive(
                &get,
                "MAX_OUTSTANDING_MESSAGES",
                d.max_outstanding_messages,
            )?,
        })
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            lock_ttl: self.lock_ttl,
            slow_threshold: self.slow_job_threshold,
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            max_consecutive_failures: self.subscription_max_failures,
            retry_delay: self.subscription_retry_delay,
            receive: ReceiveSettings::default().with_max_outstanding(self.max_outstanding_messages),
            ..RunnerConfig::default()
        }
    }

    pub fn cache_refresh(&self) -> CacheRefreshConfig {
        CacheRefreshConfig {
            workers: self.cache_workers,
            queue_capacity: self.cache_queue_capacity,
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(from(&[]).unwrap(), ServiceConfig::default());
    }

    #[test]
    fn values_are_read_from_the_environment() {
        let cfg = from(&[
            ("DEPLOY_ENV", "prod"),
            ("APP_ID", "billing"),
            ("REDIS_URL", "redis://cache:6379"),
            ("LOCK_TTL_SECS", "45"),
            ("SUBSCRIPTION_RETRY_DELAY_MS", "500"),
            ("MAX_OUTSTANDING_MESSAGES", " 8 "),
        ])
        .unwrap();

        assert_eq!(cfg.deploy_env, "prod");
        assert_eq!(cfg.app_id, "billing");
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.dispatcher().lock_ttl, Duration::from_secs(45));
        assert_eq!(cfg.runner().retry_delay, Duration::from_millis(500));
        assert_eq!(cfg.runner().receive.max_outstanding_messages, 8);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = from(&[("REDIS_URL", "  "), ("DEPLOY_ENV", "")]).unwrap();
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.deploy_env, "uat");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = from(&[("SLOW_JOB_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLOW_JOB_SECS", .. }));
    }

    #[test]
    fn zero_is_rejected_where_it_makes_no_sense() {
        assert!(from(&[("LOCK_TTL_SECS", "0")]).is_err());
        assert!(from(&[("CACHE_WORKERS", "0")]).is_err());
        assert!(from(&[("CACHE_QUEUE_CAPACITY", "0")]).is_err());
    }

    #[test]
    fn cache_queue_capacity_must_be_positive() {
        let err = from(&[("CACHE_QUEUE_CAPACITY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CACHE_QUEUE_CAPACITY", .. }));
        assert_eq!(
            from(&[("CACHE_QUEUE_CAPACITY", "3")]).unwrap().cache_queue_capacity,
            3
        );
    }
}
