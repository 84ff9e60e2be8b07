use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use chrono::Utc;

use crate::types::{DeadLetterReason, JobEvent, JobId};

/// Event stream plus live counters for every queue a service touches
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<super::LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Event buffer size per subscriber; lagging subscribers lose the oldest events
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_broadcaster, _) = broadcast::channel(capacity.max(1));

        Self {
            event_broadcaster,
            metrics: Arc::new(super::LiveMetrics::new()),
        }
    }

    pub fn record_job_enqueued(&self, job_id: &JobId, queue: &str, job_type: &str, delay_ms: Option<u64>) {
        let _ = self.event_broadcaster.send(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            delay_ms,
            at: Utc::now(),
        });
        self.metrics.increment_jobs_enqueued(queue);
        debug!("Recorded job enqueued: {} ({})", job_id, job_type);
    }

    pub fn record_job_started(&self, job_id: &JobId, queue: &str, attempt: u32) {
        let _ = self.event_broadcaster.send(JobEvent::Started {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            attempt,
            at: Utc::now(),
        });
        self.metrics.increment_jobs_started(queue);
    }

    pub fn record_job_completed(&self, job_id: &JobId, queue: &str, attempt: u32, elapsed: Duration) {
        let _ = self.event_broadcaster.send(JobEvent::Completed {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            attempt,
            at: Utc::now(),
        });
        self.metrics.increment_jobs_completed(queue);
        self.metrics.record_execution_time(queue, elapsed);
        debug!("Recorded job completed: {} on attempt {}", job_id, attempt);
    }

    pub fn record_job_retrying(
        &self,
        job_id: &JobId,
        queue: &str,
        attempt: u32,
        retry_delay: Duration,
        error: &str,
    ) {
        let _ = self.event_broadcaster.send(JobEvent::Retrying {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            attempt,
            retry_delay_ms: retry_delay.as_millis() as u64,
            error: error.to_string(),
            at: Utc::now(),
        });
        self.metrics.increment_jobs_retried(queue);
        debug!("Recorded job retrying: {} after attempt {}", job_id, attempt);
    }

    pub fn record_job_dead_lettered(
        &self,
        job_id: Option<&JobId>,
        queue: &str,
        reason: DeadLetterReason,
        error: &str,
    ) {
        let _ = self.event_broadcaster.send(JobEvent::DeadLettered {
            job_id: job_id.cloned(),
            queue: queue.to_string(),
            reason,
            error: error.to_string(),
            at: Utc::now(),
        });
        self.metrics.increment_jobs_dead_lettered(queue, reason);
        debug!("Recorded job dead-lettered on {} ({})", queue, reason.name());
    }

    /// Subscribe to job events from now on
    pub fn event_stream(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    pub fn metrics(&self) -> &super::LiveMetrics {
        &self.metrics
    }

    pub fn shared_metrics(&self) -> Arc<super::LiveMetrics> {
        self.metrics.clone()
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived rates over an observability layer's counters
pub struct PerformanceAnalytics {
    observability: Arc<ObservabilityLayer>,
}

impl PerformanceAnalytics {
    pub fn new(observability: Arc<ObservabilityLayer>) -> Self {
        Self { observability }
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.observability.metrics.jobs_completed() as f64;
        let dead = self.observability.metrics.jobs_dead_lettered() as f64;
        let total = completed + dead;

        if total == 0.0 {
            100.0
        } else {
            (completed / total) * 100.0
        }
    }

    /// Retries per started attempt, as a percentage
    pub fn retry_rate(&self) -> f64 {
        let retried = self.observability.metrics.jobs_retried() as f64;
        let started = self.observability.metrics.jobs_started() as f64;

        if started == 0.0 {
            0.0
        } else {
            (retried / started) * 100.0
        }
    }
}
