use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

use crate::backend::Transport;
use crate::codec::CodecRegistry;
use crate::config::QueueConfig;
use crate::connection::BrokerConnection;
use crate::consumer::{AttemptLedger, ProcessorRegistry};
use crate::consumer::worker::WorkerShared;
use crate::job::{processor_fn, Job, JobPayload, JobProcessor};
use crate::observability::{LiveMetrics, ObservabilityLayer};
use crate::producer::Producer;
use crate::topology::{dead_letter_queue_name, QueueTopology, TopologyManager};
use crate::types::{ConnectionState, JobEvent, JobId, JobOptions};
use crate::{JobError, QueueResult};

/// The queue API used by the rest of the application.
///
/// Enqueue calls are fire-and-forget: callers get a job id back and never
/// see retries or dead-lettering. Processors are registered per queue name.
pub struct QueueService {
    transport: Arc<dyn Transport>,
    config: QueueConfig,
    codecs: Arc<CodecRegistry>,
    observability: Arc<ObservabilityLayer>,
    connection: BrokerConnection,
    topology: Arc<TopologyManager>,
    producer: Arc<Producer>,
    registry: ProcessorRegistry,
}

impl QueueService {
    /// Service over `transport`, configured from the environment
    pub fn new(transport: impl Transport) -> Self {
        Self::with_config(transport, QueueConfig::from_env())
    }

    pub fn with_config(transport: impl Transport, config: QueueConfig) -> Self {
        Self::assemble(
            Arc::new(transport),
            config,
            Arc::new(CodecRegistry::new()),
            Arc::new(ObservabilityLayer::new()),
        )
    }

    /// Replace the codec registry. Call before `connect`.
    pub fn with_codec_registry(self, registry: CodecRegistry) -> Self {
        Self::assemble(self.transport, self.config, Arc::new(registry), self.observability)
    }

    /// Replace the observability layer. Call before `connect`.
    pub fn with_observability(self, observability: ObservabilityLayer) -> Self {
        Self::assemble(self.transport, self.config, self.codecs, Arc::new(observability))
    }

    fn assemble(
        transport: Arc<dyn Transport>,
        config: QueueConfig,
        codecs: Arc<CodecRegistry>,
        observability: Arc<ObservabilityLayer>,
    ) -> Self {
        let connection = BrokerConnection::new(
            transport.clone(),
            config.url.clone(),
            config.prefetch,
            config.reconnect_delay,
        );
        let topology = Arc::new(TopologyManager::new(connection.clone()));
        let producer = Arc::new(Producer::new(
            topology.clone(),
            codecs.clone(),
            observability.clone(),
            config.default_max_retries,
            config.default_retry_delay.as_millis() as u64,
        ));
        let registry = ProcessorRegistry::new(WorkerShared {
            connection: connection.clone(),
            topology: topology.clone(),
            producer: producer.clone(),
            codecs: codecs.clone(),
            observability: observability.clone(),
            ledger: AttemptLedger::new(),
            retry_strategy: config.retry_strategy,
            default_max_retries: config.default_max_retries,
            default_retry_delay: config.default_retry_delay,
            consumer_tag_prefix: config.consumer_tag_prefix.clone(),
        });

        Self {
            transport,
            config,
            codecs,
            observability,
            connection,
            topology,
            producer,
            registry,
        }
    }

    /// Connect to the broker and restart workers for any registered processors.
    ///
    /// Without a configured URL this succeeds and the service stays degraded:
    /// enqueue and registration then fail with `BrokerUnavailable`.
    #[instrument(skip(self), fields(transport = self.transport.name()))]
    pub async fn connect(&self) -> QueueResult<()> {
        self.config.validate()?;
        self.connection.connect().await?;

        if self.connection.is_connected() {
            self.registry.resume_all().await?;
        }
        Ok(())
    }

    /// Stop all workers, then close the channel and connection.
    /// Registrations are kept and resume on the next `connect`.
    pub async fn disconnect(&self) {
        self.registry.stop_all().await;
        self.connection.disconnect().await;
    }

    /// Disconnect and drop the service
    pub async fn shutdown(self) {
        self.disconnect().await;
        info!("Queue service shut down");
    }

    /// Publish a job and return its id
    #[instrument(skip(self, payload, options))]
    pub async fn add_job<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &T,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        let payload = serde_json::to_value(payload)?;
        self.producer.add_job(queue, job_type, payload, options).await
    }

    /// [`QueueService::add_job`] with `delayMs` set from `delay`
    pub async fn add_delayed_job<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &T,
        delay: Duration,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.add_job(queue, job_type, payload, options.with_delay(delay))
            .await
    }

    /// Publish a typed payload to its queue with its default options
    pub async fn enqueue<P: JobPayload>(&self, payload: &P) -> QueueResult<JobId> {
        self.enqueue_with(payload, P::default_options()).await
    }

    pub async fn enqueue_with<P: JobPayload>(&self, payload: &P, options: JobOptions) -> QueueResult<JobId> {
        self.add_job(P::QUEUE, P::JOB_TYPE, payload, options).await
    }

    /// Bind a processor to `queue` and start consuming it.
    /// Re-registering a queue stops the previous worker first.
    pub async fn register_processor(&self, queue: &str, processor: impl JobProcessor) -> QueueResult<()> {
        self.register_shared(queue, Arc::new(processor)).await
    }

    pub async fn register_shared(&self, queue: &str, processor: Arc<dyn JobProcessor>) -> QueueResult<()> {
        self.registry.register(queue, processor).await
    }

    /// Register an async closure as the processor for `queue`
    pub async fn register_processor_fn<F, Fut>(&self, queue: &str, f: F) -> QueueResult<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register_processor(queue, processor_fn(f)).await
    }

    /// Stop consuming `queue` and drop its processor
    pub async fn unregister_processor(&self, queue: &str) -> QueueResult<bool> {
        self.registry.unregister(queue).await
    }

    /// Messages ready in the main queue (in-flight deliveries are not counted)
    pub async fn get_queue_count(&self, queue: &str) -> QueueResult<u32> {
        self.topology.ensure_queue(queue).await?;
        self.connection.channel()?.message_count(queue).await
    }

    /// Messages waiting in `<queue>.dlq`
    pub async fn get_dead_letter_count(&self, queue: &str) -> QueueResult<u32> {
        let topology = self.topology.ensure_queue(queue).await?;
        self.connection
            .channel()?
            .message_count(&topology.dead_letter)
            .await
    }

    /// Drop every ready message in the main queue
    pub async fn purge_queue(&self, queue: &str) -> QueueResult<u32> {
        self.topology.ensure_queue(queue).await?;
        let purged = self.connection.channel()?.queue_purge(queue).await?;
        self.registry.ledger().forget_queue(queue);
        warn!(queue, purged, "Queue purged");
        Ok(purged)
    }

    /// Drop every message in `<queue>.dlq`
    pub async fn purge_dead_letters(&self, queue: &str) -> QueueResult<u32> {
        self.topology.ensure_queue(queue).await?;
        let dead_letter = dead_letter_queue_name(queue);
        let purged = self.connection.channel()?.queue_purge(&dead_letter).await?;
        warn!(queue = %dead_letter, purged, "Dead-letter queue purged");
        Ok(purged)
    }

    /// Liveness: a broker channel is open
    pub fn is_healthy(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Physical queues asserted for `queue` so far
    pub fn topology(&self, queue: &str) -> Option<QueueTopology> {
        self.topology.topology(queue)
    }

    pub async fn registered_queues(&self) -> Vec<String> {
        self.registry.registered_queues().await
    }

    pub async fn active_workers(&self) -> usize {
        self.registry.active_workers().await
    }

    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.observability.event_stream()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        self.observability.metrics()
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn codec_registry(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[cfg(feature = "memory")]
impl QueueService {
    /// Service on an in-process broker, with the default configuration
    pub fn in_memory(broker: crate::backend::memory::MemoryBroker) -> Self {
        Self::with_config(broker, QueueConfig::default().with_url("memory://local"))
    }
}
