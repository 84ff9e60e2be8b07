use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::ledger::AttemptLedger;
use crate::backend::{BrokerChannel, Delivery, DeliveryStream};
use crate::codec::CodecRegistry;
use crate::config::RetryStrategy;
use crate::connection::BrokerConnection;
use crate::job::{Job, JobProcessor};
use crate::observability::ObservabilityLayer;
use crate::producer::{Producer, X_MAX_RETRIES, X_RETRY_DELAY};
use crate::topology::TopologyManager;
use crate::types::{ConsumerTag, DeadLetterReason, JobEnvelope};
use crate::{JobError, QueueError, QueueResult};

/// Everything a queue worker needs, shared by all workers of a registry
pub(crate) struct WorkerShared {
    pub connection: BrokerConnection,
    pub topology: Arc<TopologyManager>,
    pub producer: Arc<Producer>,
    pub codecs: Arc<CodecRegistry>,
    pub observability: Arc<ObservabilityLayer>,
    pub ledger: AttemptLedger,
    pub retry_strategy: RetryStrategy,
    pub default_max_retries: u32,
    pub default_retry_delay: Duration,
    pub consumer_tag_prefix: String,
}

/// Handle for stopping a queue worker
pub struct WorkerHandle {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<QueueResult<()>>,
}

impl WorkerHandle {
    /// Stop consuming. A job waiting out its retry delay is requeued at once,
    /// and deliveries not yet started go back to the queue.
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker join error: {}", e)))?
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The worker task has exited, e.g. after the connection was closed
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
    tag: ConsumerTag,
    epoch: u64,
}

/// Consumes one queue, one delivery at a time
pub(crate) struct QueueWorker {
    shared: Arc<WorkerShared>,
    queue: String,
    processor: Arc<dyn JobProcessor>,
}

enum Outcome {
    Ack,
    Retry { delay: Duration, error: JobError },
    DeadLetter { reason: DeadLetterReason, error: String },
}

impl QueueWorker {
    /// Subscribe now, so registration errors reach the caller, then consume in the background
    pub(crate) async fn start(
        shared: Arc<WorkerShared>,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> QueueResult<WorkerHandle> {
        let worker = Self {
            shared,
            queue: queue.to_string(),
            processor,
        };
        let subscription = worker.subscribe().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("queue_worker", queue = %queue);
        let join_handle = tokio::spawn(worker.run(subscription, shutdown_rx).instrument(span));

        Ok(WorkerHandle {
            queue: queue.to_string(),
            shutdown_tx,
            join_handle,
        })
    }

    async fn subscribe(&self) -> QueueResult<Subscription> {
        let epoch = self.shared.connection.epoch();
        self.shared.topology.ensure_queue(&self.queue).await?;

        let channel = self.shared.connection.channel()?;
        let tag = ConsumerTag::for_queue(&self.shared.consumer_tag_prefix, &self.queue);
        let deliveries = channel.basic_consume(&self.queue, &tag).await?;
        debug!(queue = %self.queue, consumer_tag = %tag, "Consumer attached");

        Ok(Subscription {
            channel,
            deliveries,
            tag,
            epoch,
        })
    }

    async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        info!("Worker started for queue: {}", self.queue);

        loop {
            loop {
                tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => {
                        self.release(&mut subscription).await;
                        info!("Worker stopped for queue: {}", self.queue);
                        return Ok(());
                    }

                    next = subscription.deliveries.next() => match next {
                        Some(delivery) => {
                            self.handle_delivery(subscription.channel.as_ref(), delivery, &mut shutdown)
                                .await
                        }
                        None => break,
                    }
                }
            }

            warn!(queue = %self.queue, "Delivery stream ended, waiting for the broker connection");

            let mut last_epoch = subscription.epoch;
            subscription = loop {
                let epoch = tokio::select! {
                    _ = stopped(&mut shutdown) => return Ok(()),
                    epoch = self.shared.connection.wait_for_epoch_after(last_epoch) => epoch,
                };

                let Some(epoch) = epoch else {
                    info!("Broker connection closed, worker stopped for queue: {}", self.queue);
                    return Ok(());
                };

                match self.subscribe().await {
                    Ok(fresh) => {
                        info!(queue = %self.queue, epoch, "Resumed consuming after reconnect");
                        break fresh;
                    }
                    Err(e) => {
                        warn!(queue = %self.queue, "Failed to resume consumer: {}", e);
                        last_epoch = epoch;
                    }
                }
            };
        }
    }

    /// Cancel the consumer, then requeue whatever the broker already pushed to it.
    /// `basic.cancel` leaves those deliveries unacked.
    async fn release(&self, subscription: &mut Subscription) {
        if let Err(e) = subscription.channel.basic_cancel(&subscription.tag).await {
            debug!("Consumer cancel skipped: {}", e);
        }

        let mut released = 0;
        while let Some(Some(delivery)) = subscription.deliveries.next().now_or_never() {
            match subscription.channel.basic_nack(delivery.delivery_tag, true).await {
                Ok(()) => released += 1,
                Err(e) => warn!(queue = %self.queue, "Failed to requeue buffered delivery: {}", e),
            }
        }
        if released > 0 {
            debug!(queue = %self.queue, released, "Returned buffered deliveries to the queue");
        }
    }

    async fn handle_delivery(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let content_type = delivery.properties.content_type.as_deref();
        let mut envelope = match self.shared.codecs.decode(content_type, &delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    message_id = ?delivery.properties.message_id,
                    "Malformed job body, dead-lettering: {}", e
                );
                self.dead_letter(channel, &delivery, None, DeadLetterReason::Malformed, &e.to_string())
                    .await;
                return;
            }
        };

        let attempt = self.shared.ledger.begin_attempt(&self.queue, &mut envelope);
        let job = Job::from_envelope(&self.queue, &envelope);
        self.shared
            .observability
            .record_job_started(&envelope.id, &self.queue, attempt);
        debug!(job_id = %envelope.id, job_type = %envelope.job_type, attempt, "Processing job");

        let started = Instant::now();
        let result = AssertUnwindSafe(self.processor.process(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::retryable("processor panicked")));

        match self.decide(&delivery, &envelope, result) {
            Outcome::Ack => {
                if let Err(e) = channel.basic_ack(delivery.delivery_tag).await {
                    warn!(job_id = %envelope.id, "Failed to ack job: {}", e);
                    return;
                }
                self.shared.ledger.forget(&envelope.id);
                self.shared.observability.record_job_completed(
                    &envelope.id,
                    &self.queue,
                    attempt,
                    started.elapsed(),
                );
                info!(job_id = %envelope.id, attempt, "Job completed");
            }
            Outcome::Retry { delay, error } => {
                warn!(
                    job_id = %envelope.id,
                    attempt,
                    "Job failed, retrying in {:?}: {}", delay, error.message()
                );
                self.shared.observability.record_job_retrying(
                    &envelope.id,
                    &self.queue,
                    attempt,
                    delay,
                    error.message(),
                );
                self.retry(channel, &delivery, &envelope, delay, shutdown).await;
            }
            Outcome::DeadLetter { reason, error } => {
                error!(
                    job_id = %envelope.id,
                    attempt,
                    reason = reason.name(),
                    "Job failed permanently: {}", error
                );
                self.dead_letter(channel, &delivery, Some(&envelope), reason, &error)
                    .await;
            }
        }
    }

    /// Retry budget comes from the message headers, falling back to the configured defaults
    fn decide(&self, delivery: &Delivery, envelope: &JobEnvelope, result: Result<(), JobError>) -> Outcome {
        let error = match result {
            Ok(()) => return Outcome::Ack,
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Outcome::DeadLetter {
                reason: DeadLetterReason::Permanent,
                error: error.message().to_string(),
            };
        }

        let max_retries = delivery
            .properties
            .header(X_MAX_RETRIES)
            .and_then(|value| value.as_i64())
            .map(|value| value.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(self.shared.default_max_retries);
        let delay = delivery
            .properties
            .header(X_RETRY_DELAY)
            .and_then(|value| value.as_i64())
            .map(|value| Duration::from_millis(value.max(0) as u64))
            .unwrap_or(self.shared.default_retry_delay);

        if envelope.attempts < max_retries {
            Outcome::Retry { delay, error }
        } else {
            Outcome::DeadLetter {
                reason: DeadLetterReason::RetriesExhausted,
                error: error.message().to_string(),
            }
        }
    }

    async fn retry(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        envelope: &JobEnvelope,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        if self.shared.retry_strategy == RetryStrategy::DelayQueue {
            let delay_ms = delay.as_millis() as u64;
            match self
                .shared
                .producer
                .republish_delayed(&self.queue, envelope, delay_ms)
                .await
            {
                Ok(()) => {
                    if let Err(e) = channel.basic_ack(delivery.delivery_tag).await {
                        warn!(job_id = %envelope.id, "Failed to ack republished job: {}", e);
                    }
                    self.shared.ledger.forget(&envelope.id);
                    return;
                }
                Err(e) => {
                    warn!(job_id = %envelope.id, "Republish failed, requeueing instead: {}", e);
                }
            }
        } else {
            // holds the in-flight slot for the whole delay
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(shutdown) => {
                    debug!(job_id = %envelope.id, "Worker stopping, requeueing before the retry delay ends");
                }
            }
        }

        if let Err(e) = channel.basic_nack(delivery.delivery_tag, true).await {
            warn!(job_id = %envelope.id, "Failed to requeue job: {}", e);
        }
    }

    async fn dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        envelope: Option<&JobEnvelope>,
        reason: DeadLetterReason,
        error: &str,
    ) {
        if let Err(e) = channel.basic_nack(delivery.delivery_tag, false).await {
            warn!(queue = %self.queue, "Failed to reject job: {}", e);
            return;
        }

        let job_id = envelope.map(|envelope| &envelope.id);
        if let Some(id) = job_id {
            self.shared.ledger.forget(id);
        }
        self.shared
            .observability
            .record_job_dead_lettered(job_id, &self.queue, reason, error);
    }
}

/// Resolves once the handle asks the worker to stop, or is dropped
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
