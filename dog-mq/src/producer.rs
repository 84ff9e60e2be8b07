use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::backend::{MessageProperties, OutboundMessage};
use crate::codec::CodecRegistry;
use crate::observability::ObservabilityLayer;
use crate::topology::TopologyManager;
use crate::types::{JobEnvelope, JobId, JobOptions};
use crate::QueueResult;

/// Header carrying the retry budget of a message
pub const X_MAX_RETRIES: &str = "x-max-retries";
/// Header carrying the delay between attempts, in milliseconds
pub const X_RETRY_DELAY: &str = "x-retry-delay";

/// Builds envelopes and publishes them to the main queue or a delay queue
pub struct Producer {
    topology: Arc<TopologyManager>,
    codecs: Arc<CodecRegistry>,
    observability: Arc<ObservabilityLayer>,
    default_max_retries: u32,
    default_retry_delay_ms: u64,
}

impl Producer {
    pub fn new(
        topology: Arc<TopologyManager>,
        codecs: Arc<CodecRegistry>,
        observability: Arc<ObservabilityLayer>,
        default_max_retries: u32,
        default_retry_delay_ms: u64,
    ) -> Self {
        Self {
            topology,
            codecs,
            observability,
            default_max_retries,
            default_retry_delay_ms,
        }
    }

    /// Publish a new job and return its id without waiting for consumption.
    ///
    /// A positive `delayMs` routes the job through `<queue>.delay.<ms>`.
    /// Publish failures are returned as-is; nothing is retried here.
    #[instrument(skip(self, payload, options), fields(queue = %queue, job_type = %job_type))]
    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.topology.ensure_queue(queue).await?;

        let envelope = JobEnvelope::new(job_type, payload, options);
        let delay_ms = envelope.options.effective_delay_ms();

        let target = match delay_ms {
            Some(delay_ms) => self.topology.ensure_delay_queue(queue, delay_ms).await?,
            None => queue.to_string(),
        };

        self.publish_envelope(&target, &envelope).await?;

        self.observability
            .record_job_enqueued(&envelope.id, queue, job_type, delay_ms);
        info!(job_id = %envelope.id, target = %target, "Enqueued job");

        Ok(envelope.id)
    }

    /// Put an existing envelope (same id, current attempt count) back through
    /// the delay queue for `delay_ms`
    pub(crate) async fn republish_delayed(
        &self,
        queue: &str,
        envelope: &JobEnvelope,
        delay_ms: u64,
    ) -> QueueResult<()> {
        let target = if delay_ms == 0 {
            self.topology.ensure_queue(queue).await?;
            queue.to_string()
        } else {
            self.topology.ensure_delay_queue(queue, delay_ms).await?
        };
        self.publish_envelope(&target, envelope).await?;
        debug!(job_id = %envelope.id, target = %target, attempts = envelope.attempts, "Republished job for retry");
        Ok(())
    }

    async fn publish_envelope(&self, target: &str, envelope: &JobEnvelope) -> QueueResult<()> {
        let (body, content_type) = self.codecs.encode(envelope)?;
        let channel = self.topology.connection().channel()?;

        channel
            .basic_publish(
                target,
                OutboundMessage {
                    body,
                    properties: self.properties_for(envelope, content_type),
                },
            )
            .await
    }

    fn properties_for(&self, envelope: &JobEnvelope, content_type: &str) -> MessageProperties {
        let options = &envelope.options;
        MessageProperties::default()
            .with_message_id(envelope.id.as_str())
            .with_content_type(content_type)
            .persistent()
            .with_timestamp(envelope.created_at.timestamp())
            .with_header(X_MAX_RETRIES, options.max_retries_or(self.default_max_retries))
            .with_header(X_RETRY_DELAY, options.retry_delay_ms_or(self.default_retry_delay_ms))
    }
}
