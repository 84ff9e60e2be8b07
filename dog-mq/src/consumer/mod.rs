//! Processor registration and the per-queue consumption loops.
//!
//! Each registered queue gets one worker task with its own consumer, so a
//! prefetch of 1 gives one job in flight per queue while different queues
//! proceed independently.

pub mod ledger;
pub mod worker;

pub use ledger::AttemptLedger;
pub use worker::WorkerHandle;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::job::JobProcessor;
use crate::QueueResult;
use worker::{QueueWorker, WorkerShared};

struct Registration {
    processor: Arc<dyn JobProcessor>,
    worker: Option<WorkerHandle>,
}

/// Queue name to processor, plus the worker consuming for it.
///
/// Registrations outlive their workers: after [`ProcessorRegistry::stop_all`]
/// (or a connection shutdown) [`ProcessorRegistry::resume_all`] starts a new
/// worker for every queue that still has a processor.
pub struct ProcessorRegistry {
    shared: Arc<WorkerShared>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl ProcessorRegistry {
    pub(crate) fn new(shared: WorkerShared) -> Self {
        Self {
            shared: Arc::new(shared),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `processor` to `queue` and start consuming.
    ///
    /// An existing worker for the queue is stopped first, so the old and new
    /// processor never run side by side. If the new consumer cannot be
    /// attached the error is returned and the previous processor stays
    /// registered (without a worker) for a later [`ProcessorRegistry::resume_all`].
    #[instrument(skip(self, processor))]
    pub async fn register(&self, queue: &str, processor: Arc<dyn JobProcessor>) -> QueueResult<()> {
        let mut registrations = self.registrations.lock().await;

        if let Some(existing) = registrations.get_mut(queue) {
            warn!("Replacing processor for queue: {}", queue);
            if let Some(worker) = existing.worker.take() {
                if let Err(e) = worker.shutdown().await {
                    warn!("Previous worker for {} ended with error: {}", queue, e);
                }
            }
        }

        let worker = QueueWorker::start(self.shared.clone(), queue, processor.clone()).await?;
        registrations.insert(
            queue.to_string(),
            Registration {
                processor,
                worker: Some(worker),
            },
        );

        info!("Registered processor for queue: {}", queue);
        Ok(())
    }

    /// Stop the worker and forget the processor for `queue`
    pub async fn unregister(&self, queue: &str) -> QueueResult<bool> {
        let registration = self.registrations.lock().await.remove(queue);
        match registration {
            Some(Registration { worker: Some(worker), .. }) => {
                worker.shutdown().await?;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Start a worker for every registration that has none running.
    /// Returns how many were started; the first failure is returned after trying all.
    pub async fn resume_all(&self) -> QueueResult<usize> {
        let mut registrations = self.registrations.lock().await;
        let mut started = 0;
        let mut first_error = None;

        for (queue, registration) in registrations.iter_mut() {
            let running = registration
                .worker
                .as_ref()
                .map(|worker| !worker.is_finished())
                .unwrap_or(false);
            if running {
                continue;
            }

            match QueueWorker::start(self.shared.clone(), queue, registration.processor.clone()).await {
                Ok(worker) => {
                    registration.worker = Some(worker);
                    started += 1;
                }
                Err(e) => {
                    warn!("Failed to resume worker for {}: {}", queue, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if started > 0 {
            info!("Resumed {} queue workers", started);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Stop every worker but keep the registrations
    pub async fn stop_all(&self) {
        let mut registrations = self.registrations.lock().await;
        for (queue, registration) in registrations.iter_mut() {
            if let Some(worker) = registration.worker.take() {
                if let Err(e) = worker.shutdown().await {
                    warn!("Worker for {} ended with error: {}", queue, e);
                }
            }
        }
    }

    /// Registered queue names, sorted
    pub async fn registered_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub async fn is_registered(&self, queue: &str) -> bool {
        self.registrations.lock().await.contains_key(queue)
    }

    /// Workers whose task is still running
    pub async fn active_workers(&self) -> usize {
        self.registrations
            .lock()
            .await
            .values()
            .filter(|registration| {
                registration
                    .worker
                    .as_ref()
                    .map(|worker| !worker.is_finished())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.shared.ledger
    }
}
