use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Why a delivery ended up in a dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Every allowed attempt failed
    RetriesExhausted,
    /// The handler reported a permanent error
    Permanent,
    /// The message body could not be decoded into an envelope
    Malformed,
}

impl DeadLetterReason {
    pub fn name(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Permanent => "permanent",
            Self::Malformed => "malformed",
        }
    }
}

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was published to its main queue or a delay queue
    Enqueued {
        job_id: JobId,
        queue: String,
        job_type: String,
        delay_ms: Option<u64>,
        at: DateTime<Utc>,
    },

    /// A consumer began a processing attempt
    Started {
        job_id: JobId,
        queue: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// Handler returned successfully and the delivery was acknowledged
    Completed {
        job_id: JobId,
        queue: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// Handler failed and the job will be redelivered
    Retrying {
        job_id: JobId,
        queue: String,
        attempt: u32,
        retry_delay_ms: u64,
        error: String,
        at: DateTime<Utc>,
    },

    /// Delivery was rejected without requeue and routed to the dead-letter queue
    DeadLettered {
        job_id: Option<JobId>,
        queue: String,
        reason: DeadLetterReason,
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// Get the job ID, absent only for bodies that never decoded
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. } => Some(job_id),
            Self::DeadLettered { job_id, .. } => job_id.as_ref(),
        }
    }

    /// Logical queue the event belongs to
    pub fn queue(&self) -> &str {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Started { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::DeadLettered { queue, .. } => queue,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Started { at, .. }
            | Self::Completed { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. } => at,
        }
    }
}
