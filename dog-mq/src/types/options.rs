use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of processing attempts before a job is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait before a failed job is redelivered
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Per-job enqueue options. Every field is optional on the wire.
///
/// `priority`, `timeout_ms`, `remove_on_complete` and `remove_on_fail` are
/// carried in the envelope for handlers and operators; the queue itself
/// delivers FIFO, never kills a running handler and stores no results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<bool>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the job no earlier than `delay` from now
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay_ms = Some(retry_delay.as_millis() as u64);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn with_remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    /// Delay in milliseconds, `None` when the job should be delivered immediately
    pub fn effective_delay_ms(&self) -> Option<u64> {
        self.delay_ms.filter(|ms| *ms > 0)
    }

    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    pub fn retry_delay_ms_or(&self, default: u64) -> u64 {
        self.retry_delay_ms.unwrap_or(default)
    }

    /// Fill unset retry fields from process-wide defaults
    pub fn with_defaults(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries.get_or_insert(max_retries);
        self.retry_delay_ms.get_or_insert(retry_delay_ms);
        self
    }
}
