//! # dog-mq: Broker-Backed Job Queue
//!
//! Typed jobs published to a message broker, consumed one at a time per
//! queue, retried a bounded number of times and dead-lettered when they
//! keep failing.
//!
//! - **Delayed delivery** through per-delay TTL queues that dead-letter back
//!   into the main queue, with no in-process timers
//! - **Single flight per queue**: manual acks with a prefetch of 1
//! - **Bounded retries** driven by `x-max-retries` / `x-retry-delay` headers,
//!   then routing to `<queue>.dlq` by the broker itself
//! - **Reconnect** on a fixed delay, with consumers re-attached afterwards
//! - **Degraded mode**: no broker URL means the service boots and every
//!   enqueue fails with `BrokerUnavailable`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_mq::prelude::*;
//! use dog_mq::backend::memory::MemoryBroker;
//! use serde_json::json;
//!
//! # async fn run() -> QueueResult<()> {
//! let queue = QueueService::in_memory(MemoryBroker::new());
//! queue.connect().await?;
//!
//! queue
//!     .register_processor_fn("email-queue", |job: Job| async move {
//!         let to = job.data["to"].as_str().unwrap_or_default().to_string();
//!         println!("sending to {} (attempt {})", to, job.attempts);
//!         Ok(())
//!     })
//!     .await?;
//!
//! let id = queue
//!     .add_job("email-queue", "send-email", &json!({"to": "a@b.com"}), JobOptions::new())
//!     .await?;
//! println!("enqueued {}", id);
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod codec;
pub mod backend;
pub mod connection;
pub mod topology;
pub mod producer;
pub mod job;
pub mod consumer;
pub mod service;
pub mod jobs;
pub mod observability;

pub use types::{
    ConnectionState, ConsumerTag, DeadLetterReason, DeliveryTag, JobEnvelope, JobEvent, JobId,
    JobOptions,
};
pub use error::{QueueError, QueueResult, JobError};
pub use config::{QueueConfig, RetryStrategy};
pub use codec::{EnvelopeCodec, CodecRegistry};
pub use codec::json::JsonCodec;
pub use backend::{BrokerChannel, Transport};
pub use connection::BrokerConnection;
pub use topology::{QueueTopology, TopologyManager};
pub use producer::Producer;
pub use job::{processor_fn, Job, JobPayload, JobProcessor, JobRouter};
pub use consumer::{ProcessorRegistry, WorkerHandle};
pub use service::QueueService;

pub use observability::{ObservabilityLayer, LiveMetrics};

#[cfg(feature = "memory")]
pub use backend::memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use backend::amqp::AmqpTransport;

#[cfg(feature = "tracing-basic")]
pub use observability::logging::{init_tracing, LogFormat};

/// Everything needed to enqueue jobs and register processors
pub mod prelude {
    pub use crate::{
        QueueService, QueueConfig, RetryStrategy
    };

    pub use crate::{
        Job, JobId, JobOptions, JobError, JobPayload, JobProcessor, JobRouter, processor_fn,
        QueueError, QueueResult, ConnectionState
    };

    pub use crate::{ObservabilityLayer, LiveMetrics, JobEvent};

    pub use async_trait::async_trait;
}
