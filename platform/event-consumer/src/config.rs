use std::env;
use std::str::FromStr;
use std::time::Duration;

/// When deliveries are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitStrategy {
    /// Ack on receipt, before the handler runs; failures are not redelivered
    AutoImmediate,
    /// Ack once the handler completed or the message was dead-lettered
    #[default]
    ManualAfterHandle,
}

impl FromStr for CommitStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CommitStrategy::AutoImmediate),
            "manual" => Ok(CommitStrategy::ManualAfterHandle),
            other => Err(ConfigError::Invalid {
                name: "CONSUMER_COMMIT_STRATEGY",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Consumer runtime configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group / durable name
    pub group: String,
    pub topics: Vec<String>,
    pub commit_strategy: CommitStrategy,
    /// Default per-invocation timeout; registrations may override it
    pub handler_timeout: Duration,
    pub workers: usize,
    /// Handler attempts per message before dead-lettering
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long in-flight handlers may run after shutdown starts
    pub shutdown_grace: Duration,
    /// Deliveries buffered per worker
    pub queue_capacity: usize,
    /// How often a running handler tells the broker it is still working.
    /// Keep it below the broker's redelivery deadline (30s on JetStream).
    pub progress_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group: group.into(),
            topics,
            commit_strategy: CommitStrategy::default(),
            handler_timeout: Duration::from_millis(30_000),
            workers: 8,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(10_000),
            queue_capacity: 64,
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any name → value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let group = lookup("CONSUMER_GROUP")
            .filter(|g| !g.trim().is_empty())
            .ok_or(ConfigError::Missing("CONSUMER_GROUP"))?;

        let topics: Vec<String> = lookup("CONSUMER_TOPICS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if topics.is_empty() {
            return Err(ConfigError::Missing("CONSUMER_TOPICS"));
        }

        let defaults = Self::new(group, topics);

        let commit_strategy = match lookup("CONSUMER_COMMIT_STRATEGY") {
            Some(value) => value.parse()?,
            None => defaults.commit_strategy,
        };

        let workers: usize = parse_or(&lookup, "CONSUMER_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_WORKERS",
                value: "0".to_string(),
            });
        }

        let max_attempts: u32 = parse_or(&lookup, "CONSUMER_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            commit_strategy,
            handler_timeout: Duration::from_millis(parse_or(
                &lookup,
                "CONSUMER_HANDLER_TIMEOUT_MS",
                30_000,
            )?),
            workers,
            max_attempts,
            shutdown_grace: Duration::from_millis(parse_or(
                &lookup,
                "CONSUMER_SHUTDOWN_GRACE_MS",
                10_000,
            )?),
            progress_interval: Duration::from_millis(parse_or(
                &lookup,
                "CONSUMER_PROGRESS_INTERVAL_MS",
                10_000,
            )?)
            .max(Duration::from_millis(1)),
            ..defaults
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
