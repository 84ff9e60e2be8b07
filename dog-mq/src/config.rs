use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::types::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use crate::{QueueError, QueueResult};

/// How a failed attempt is scheduled for redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    /// Hold the delivery for the retry delay, then `nack(requeue = true)`.
    /// The queue makes no progress while the delivery is held.
    #[default]
    Requeue,
    /// Republish to `<queue>.delay.<retryDelayMs>` and ack right away.
    /// The consumer is free to take the next message immediately.
    DelayQueue,
}

impl RetryStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::DelayQueue => "delay-queue",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RetryStrategy {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "delay-queue" | "delay_queue" | "delay" => Ok(Self::DelayQueue),
            other => Err(QueueError::InvalidConfig(format!("unknown retry strategy: {}", other))),
        }
    }
}

/// Queue service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Broker URL; `None` runs the service in degraded mode
    pub url: Option<String>,
    /// Unacknowledged deliveries per consumer
    pub prefetch: u16,
    /// Wait between reconnect attempts after the broker drops the connection
    pub reconnect_delay: Duration,
    /// Used when a job does not set `maxRetries`
    pub default_max_retries: u32,
    /// Used when a job does not set `retryDelayMs`
    pub default_retry_delay: Duration,
    pub retry_strategy: RetryStrategy,
    /// Consumer tags are `<prefix>.<queue>.<suffix>`
    pub consumer_tag_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefetch: 1,
            reconnect_delay: Duration::from_secs(5),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_strategy: RetryStrategy::Requeue,
            consumer_tag_prefix: "dog-mq".to_string(),
        }
    }
}

impl QueueConfig {
    /// Read configuration from the process environment.
    ///
    /// - `RABBITMQ_URL` (falls back to `AMQP_URL`)
    /// - `QUEUE_PREFETCH`
    /// - `QUEUE_RECONNECT_DELAY_MS`
    /// - `QUEUE_MAX_RETRIES`
    /// - `QUEUE_RETRY_DELAY_MS`
    /// - `QUEUE_RETRY_STRATEGY` (`requeue` or `delay-queue`)
    /// - `QUEUE_CONSUMER_TAG_PREFIX`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] over an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let url = lookup("RABBITMQ_URL")
            .or_else(|| lookup("AMQP_URL"))
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        Self {
            url,
            prefetch: parse_or(&lookup, "QUEUE_PREFETCH", defaults.prefetch),
            reconnect_delay: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_RECONNECT_DELAY_MS",
                defaults.reconnect_delay.as_millis() as u64,
            )),
            default_max_retries: parse_or(&lookup, "QUEUE_MAX_RETRIES", defaults.default_max_retries),
            default_retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_RETRY_DELAY_MS",
                defaults.default_retry_delay.as_millis() as u64,
            )),
            retry_strategy: parse_or(&lookup, "QUEUE_RETRY_STRATEGY", defaults.retry_strategy),
            consumer_tag_prefix: lookup("QUEUE_CONSUMER_TAG_PREFIX")
                .filter(|prefix| !prefix.trim().is_empty())
                .unwrap_or(defaults.consumer_tag_prefix),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.url = if url.trim().is_empty() { None } else { Some(url) };
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_consumer_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_tag_prefix = prefix.into();
        self
    }

    /// No broker configured; enqueue and registration fail with `BrokerUnavailable`
    pub fn is_degraded(&self) -> bool {
        self.url.is_none()
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.prefetch == 0 {
            return Err(QueueError::InvalidConfig(
                "prefetch must be at least 1 (0 means unbounded)".to_string(),
            ));
        }
        if self.reconnect_delay.is_zero() {
            return Err(QueueError::InvalidConfig(
                "reconnect delay must be greater than zero".to_string(),
            ));
        }
        if self.consumer_tag_prefix.trim().is_empty() {
            return Err(QueueError::InvalidConfig(
                "consumer tag prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid queue setting, using default");
            default
        }),
    }
}
