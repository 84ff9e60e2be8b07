pub mod router;

pub use router::JobRouter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::types::{JobEnvelope, JobId, JobOptions};
use crate::JobError;

/// A job as handed to a processor
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub data: Value,
    /// 1 on the first attempt
    pub attempts: u32,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    /// Logical queue the job was consumed from
    pub queue: String,
}

impl Job {
    pub(crate) fn from_envelope(queue: &str, envelope: &JobEnvelope) -> Self {
        Self {
            id: envelope.id.clone(),
            job_type: envelope.job_type.clone(),
            data: envelope.payload.clone(),
            attempts: envelope.attempts,
            options: envelope.options.clone(),
            created_at: envelope.created_at,
            queue: queue.to_string(),
        }
    }

    /// Decode the payload; a shape mismatch can never succeed on retry, so it is permanent
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            JobError::Permanent(format!(
                "Failed to decode {} payload: {}",
                self.job_type, e
            ))
        })
    }

    /// The job's `timeoutMs`. Not enforced by the queue; handlers honor it themselves.
    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_first_attempt(&self) -> bool {
        self.attempts <= 1
    }
}

/// Handles every job consumed from one queue.
///
/// Returning `Ok` acknowledges the delivery. Any error is the failure signal;
/// [`JobError::Permanent`] skips the remaining retries. Delivery is
/// at-least-once, so processors must tolerate running a job twice.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: Job) -> Result<(), JobError>;
}

/// [`JobProcessor`] backed by an async closure
pub struct ProcessorFn<F> {
    f: F,
}

/// Wrap an async closure as a processor
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    ProcessorFn { f }
}

#[async_trait]
impl<F, Fut> JobProcessor for ProcessorFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn process(&self, job: Job) -> Result<(), JobError> {
        (self.f)(job).await
    }
}

/// A typed job payload bound to a queue and job type
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue the job is published to
    const QUEUE: &'static str;

    /// Job type tag used for dispatch within the queue
    const JOB_TYPE: &'static str;

    /// Options applied when the caller passes none
    fn default_options() -> JobOptions {
        JobOptions::new()
    }
}
