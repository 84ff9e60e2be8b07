use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{processor_fn, Job, JobPayload, JobProcessor};
use crate::{JobError, QueueError, QueueResult};

/// Dispatches jobs of one queue to per-type processors
pub struct JobRouter {
    handlers: HashMap<String, Arc<dyn JobProcessor>>,
}

impl JobRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a processor for `job_type`; each type may be registered once
    pub fn register(&mut self, job_type: impl Into<String>, processor: impl JobProcessor) -> QueueResult<()> {
        let job_type = job_type.into();

        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::Internal(format!("Job type '{}' already registered", job_type)));
        }

        self.handlers.insert(job_type, Arc::new(processor));
        Ok(())
    }

    /// Builder form of [`JobRouter::register`]; a later route for the same type wins
    pub fn route(mut self, job_type: impl Into<String>, processor: impl JobProcessor) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(processor));
        self
    }

    pub fn route_fn<F, Fut>(self, job_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.route(job_type, processor_fn(f))
    }

    /// Route `P::JOB_TYPE` to a handler that receives the decoded payload
    pub fn handle<P, F, Fut>(self, f: F) -> Self
    where
        P: JobPayload,
        F: Fn(P, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.route(
            P::JOB_TYPE,
            TypedHandler {
                f,
                _payload: PhantomData::<fn() -> P>,
            },
        )
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for JobRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobProcessor for JobRouter {
    async fn process(&self, job: Job) -> Result<(), JobError> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| JobError::Permanent(format!("Unknown job type: {}", job.job_type)))?;

        handler.process(job).await
    }
}

struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobProcessor for TypedHandler<P, F>
where
    P: JobPayload,
    F: Fn(P, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn process(&self, job: Job) -> Result<(), JobError> {
        let payload = job.payload::<P>()?;
        (self.f)(payload, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobEnvelope, JobOptions};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl JobPayload for Ping {
        const QUEUE: &'static str = "test-queue";
        const JOB_TYPE: &'static str = "ping";
    }

    fn job(job_type: &str, data: Value) -> Job {
        Job::from_envelope("test-queue", &JobEnvelope::new(job_type, data, JobOptions::new()))
    }

    #[tokio::test]
    async fn test_dispatch_by_job_type() {
        let pings = Arc::new(AtomicU32::new(0));
        let seen = pings.clone();

        let router = JobRouter::new()
            .handle::<Ping, _, _>(move |ping, _job| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(ping.n, Ordering::SeqCst);
                    Ok(())
                }
            })
            .route_fn("pong", |_job| async { Err(JobError::retryable("pong failed")) });

        assert_eq!(router.registered_types(), vec!["ping", "pong"]);

        router.process(job("ping", json!({"n": 5}))).await.unwrap();
        assert_eq!(pings.load(Ordering::SeqCst), 5);

        let err = router.process(job("pong", json!({}))).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_permanent() {
        let router = JobRouter::new();

        match router.process(job("unknown_job", json!({}))).await.unwrap_err() {
            JobError::Permanent(msg) => assert!(msg.contains("Unknown job type")),
            other => panic!("Expected permanent error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_decode_failure_is_permanent() {
        let router = JobRouter::new().handle::<Ping, _, _>(|_ping, _job| async { Ok(()) });

        let err = router.process(job("ping", json!({"n": "five"}))).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut router = JobRouter::new();
        router
            .register("ping", processor_fn(|_job| async { Ok(()) }))
            .unwrap();
        assert!(router.register("ping", processor_fn(|_job| async { Ok(()) })).is_err());
        assert!(router.is_registered("ping"));
    }
}
