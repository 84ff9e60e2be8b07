use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, JobOptions};

/// The unit of work placed on the broker.
///
/// `attempts` starts at zero and is only advanced by the consumer holding
/// the unacknowledged delivery, immediately before each processing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub id: JobId,

    #[serde(rename = "type")]
    pub job_type: String,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub options: JobOptions,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub attempts: u32,
}

impl JobEnvelope {
    /// Build a fresh envelope with a new id and zero attempts
    pub fn new(job_type: impl Into<String>, payload: Value, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            options,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Advance the attempt counter, never moving it backwards.
    ///
    /// `observed` is the highest count already seen for this job by this
    /// process (redeliveries of an unchanged body carry a stale count).
    pub fn begin_attempt(&mut self, observed: u32) -> u32 {
        self.attempts = self.attempts.max(observed) + 1;
        self.attempts
    }
}
