use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Topology assertion failed for queue '{queue}': {reason}")]
    Topology { queue: String, reason: String },

    #[error("Publish to queue '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec not found: {0}")]
    CodecNotFound(String),

    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Job execution failed: {0}")]
    JobFailed(#[from] JobError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub(crate) fn topology(queue: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Topology {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn publish(queue: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the error means no usable broker channel exists right now
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::ConnectionLost(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Retryable error - will be redelivered if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-lettered immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// A payload that does not match its job type will never decode on a later attempt.
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("Failed to decode job payload: {}", err))
    }
}
