//! Pool configuration
//!
//! `PoolConfig` can be built in code with the `with_*` builders or loaded
//! from `TASKPOOL_*` environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// How workers are brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPolicy {
    /// Spawn `max_workers` workers when the pool starts
    #[default]
    Eager,
    /// Spawn workers on demand, up to `max_workers`
    Lazy,
}

/// What a panic inside submitted work does to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// Catch the panic at the worker boundary and fail the task
    #[default]
    Isolate,
    /// Let the panic kill the worker; the pool fails the task with
    /// `WorkerCrashed` and spawns a replacement
    CrashWorker,
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_workers must be at least 1")]
    NoWorkers,

    #[error("queue_capacity must be at least 1")]
    NoQueueCapacity,

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("backoff_coefficient must be a finite number >= 1, got {0}")]
    InvalidBackoffCoefficient(f64),

    #[error("jitter must be between 0 and 1, got {0}")]
    InvalidJitter(f64),
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Pool name, used in logs
    pub name: String,

    /// Maximum number of live workers
    pub max_workers: usize,

    /// Queue capacity (tasks waiting for a worker)
    pub queue_capacity: usize,

    /// Worker spawn policy
    #[serde(default)]
    pub spawn_policy: SpawnPolicy,

    /// Panic handling inside workers
    #[serde(default)]
    pub panic_policy: PanicPolicy,

    /// How long `submit` waits for queue space (None = indefinitely)
    #[serde(default, with = "option_duration_millis")]
    pub submit_timeout: Option<Duration>,

    /// Default execution timeout for tasks that do not set one
    #[serde(default, with = "option_duration_millis")]
    pub task_timeout: Option<Duration>,

    /// Default retry policy for tasks that do not set one
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Upper bound on how long `shutdown` may take
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "taskpool".to_string(),
            max_workers: 4,
            queue_capacity: 64,
            spawn_policy: SpawnPolicy::Eager,
            panic_policy: PanicPolicy::Isolate,
            submit_timeout: None,
            task_timeout: None,
            retry_policy: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given worker count and queue capacity
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            max_workers,
            queue_capacity,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `TASKPOOL_NAME`: pool name used in logs
    /// - `TASKPOOL_MAX_WORKERS`: maximum live workers (default: 4)
    /// - `TASKPOOL_QUEUE_CAPACITY`: queue capacity (default: 64)
    /// - `TASKPOOL_SPAWN_POLICY`: `eager` or `lazy`
    /// - `TASKPOOL_PANIC_POLICY`: `isolate` or `crash_worker`
    /// - `TASKPOOL_SUBMIT_TIMEOUT_MS`: submission timeout
    /// - `TASKPOOL_TASK_TIMEOUT_MS`: default task execution timeout
    /// - `TASKPOOL_MAX_RETRIES`: enables a default exponential retry policy
    /// - `TASKPOOL_SHUTDOWN_TIMEOUT_MS`: shutdown timeout (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let spawn_policy = match env::var("TASKPOOL_SPAWN_POLICY") {
            Ok(v) => match v.to_lowercase().as_str() {
                "eager" => SpawnPolicy::Eager,
                "lazy" => SpawnPolicy::Lazy,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "TASKPOOL_SPAWN_POLICY",
                        value: v,
                    })
                }
            },
            Err(_) => defaults.spawn_policy,
        };

        let panic_policy = match env::var("TASKPOOL_PANIC_POLICY") {
            Ok(v) => match v.to_lowercase().as_str() {
                "isolate" => PanicPolicy::Isolate,
                "crash_worker" | "crash" => PanicPolicy::CrashWorker,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "TASKPOOL_PANIC_POLICY",
                        value: v,
                    })
                }
            },
            Err(_) => defaults.panic_policy,
        };

        let config = Self {
            name: env::var("TASKPOOL_NAME").unwrap_or(defaults.name),
            max_workers: parse_env("TASKPOOL_MAX_WORKERS")?.unwrap_or(defaults.max_workers),
            queue_capacity: parse_env("TASKPOOL_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            spawn_policy,
            panic_policy,
            submit_timeout: parse_env("TASKPOOL_SUBMIT_TIMEOUT_MS")?.map(Duration::from_millis),
            task_timeout: parse_env("TASKPOOL_TASK_TIMEOUT_MS")?.map(Duration::from_millis),
            retry_policy: parse_env::<u32>("TASKPOOL_MAX_RETRIES")?
                .map(|n| RetryPolicy::exponential().with_max_retries(n)),
            shutdown_timeout: parse_env("TASKPOOL_SHUTDOWN_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_spawn_policy(mut self, policy: SpawnPolicy) -> Self {
        self.spawn_policy = policy;
        self
    }

    pub fn with_panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Set how long `submit` waits for queue space
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = Some(timeout);
        self
    }

    /// Set the default execution timeout for tasks
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set the default retry policy for tasks
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NoQueueCapacity);
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.name, "taskpool");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.spawn_policy, SpawnPolicy::Eager);
        assert_eq!(config.panic_policy, PanicPolicy::Isolate);
        assert!(config.submit_timeout.is_none());
        assert!(config.retry_policy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new(2, 4)
            .with_name("thumbnails")
            .with_spawn_policy(SpawnPolicy::Lazy)
            .with_panic_policy(PanicPolicy::CrashWorker)
            .with_submit_timeout(Duration::from_millis(250))
            .with_task_timeout(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy::exponential().with_max_retries(1))
            .with_shutdown_timeout(Duration::from_secs(2));

        assert_eq!(config.name, "thumbnails");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.spawn_policy, SpawnPolicy::Lazy);
        assert_eq!(config.panic_policy, PanicPolicy::CrashWorker);
        assert_eq!(config.submit_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.retry_policy.as_ref().map(|p| p.max_attempts), Some(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            PoolConfig::new(0, 4).validate(),
            Err(ConfigError::NoWorkers)
        );
        assert_eq!(
            PoolConfig::new(2, 0).validate(),
            Err(ConfigError::NoQueueCapacity)
        );
    }

    #[test]
    fn test_config_validation_checks_retry_policy() {
        let mut json = serde_json::to_value(
            PoolConfig::new(2, 4).with_retry_policy(RetryPolicy::exponential()),
        )
        .unwrap();
        json["retry_policy"]["backoff_coefficient"] = serde_json::json!(-2.0);
        let config: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBackoffCoefficient(-2.0))
        );

        let mut policy = RetryPolicy::exponential();
        policy.jitter = 1.5;
        assert_eq!(
            PoolConfig::new(2, 4).with_retry_policy(policy).validate(),
            Err(ConfigError::InvalidJitter(1.5))
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = PoolConfig::new(2, 8).with_task_timeout(Duration::from_millis(1500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["task_timeout"], 1500);
        assert!(json["submit_timeout"].is_null());
        assert_eq!(json["spawn_policy"], "eager");

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_from_env() {
        // Only this test touches TASKPOOL_* variables.
        env::set_var("TASKPOOL_MAX_WORKERS", "3");
        env::set_var("TASKPOOL_QUEUE_CAPACITY", "12");
        env::set_var("TASKPOOL_SPAWN_POLICY", "lazy");
        env::set_var("TASKPOOL_MAX_RETRIES", "2");
        env::set_var("TASKPOOL_TASK_TIMEOUT_MS", "750");

        let config = PoolConfig::from_env().unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.queue_capacity, 12);
        assert_eq!(config.spawn_policy, SpawnPolicy::Lazy);
        assert_eq!(config.retry_policy.map(|p| p.max_attempts), Some(3));
        assert_eq!(config.task_timeout, Some(Duration::from_millis(750)));

        env::set_var("TASKPOOL_MAX_WORKERS", "many");
        assert!(matches!(
            PoolConfig::from_env(),
            Err(ConfigError::InvalidEnv {
                var: "TASKPOOL_MAX_WORKERS",
                ..
            })
        ));

        for var in [
            "TASKPOOL_MAX_WORKERS",
            "TASKPOOL_QUEUE_CAPACITY",
            "TASKPOOL_SPAWN_POLICY",
            "TASKPOOL_MAX_RETRIES",
            "TASKPOOL_TASK_TIMEOUT_MS",
        ] {
            env::remove_var(var);
        }
    }
}
