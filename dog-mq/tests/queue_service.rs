use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

use dog_mq::{
    backend::{memory::MemoryBroker, MessageProperties, OutboundMessage},
    jobs::{SendEmail, EMAIL_QUEUE},
    DeadLetterReason, Job, JobEnvelope, JobError, JobEvent, JobOptions, JobRouter, QueueConfig,
    QueueError, QueueService, RetryStrategy, Transport,
};

/// Test factory functions
fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_url("memory://local")
        .with_default_retry_delay(Duration::from_millis(10))
        .with_reconnect_delay(Duration::from_millis(50))
}

async fn connected_service(broker: &MemoryBroker, config: QueueConfig) -> QueueService {
    let service = QueueService::with_config(broker.clone(), config);
    service.connect().await.unwrap();
    service
}

/// Poll `condition` until it holds, failing the test after five seconds
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

/// Records the attempt number of every invocation and fails with `error`
fn failing_processor(
    attempts: Arc<Mutex<Vec<u32>>>,
    error: fn() -> JobError,
) -> impl Fn(Job) -> std::future::Ready<Result<(), JobError>> + Send + Sync + 'static {
    move |job: Job| {
        attempts.lock().push(job.attempts);
        std::future::ready(Err(error()))
    }
}

fn retryable() -> JobError {
    JobError::retryable("smtp timeout")
}

/// S1. A queue runs one job at a time
#[tokio::test]
async fn test_single_flight_per_queue() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let (running, peak, completed) = (running.clone(), peak.clone(), completed.clone());
        service
            .register_processor_fn("search-index-queue", move |_job| {
                let (running, peak, completed) = (running.clone(), peak.clone(), completed.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    for n in 0..5 {
        service
            .add_job("search-index-queue", "index-document", &json!({"n": n}), JobOptions::new())
            .await
            .unwrap();
    }

    wait_until("all jobs", || completed.load(Ordering::SeqCst) == 5).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(service.metrics().jobs_completed(), 5);
}

/// S2. Queues do not block each other
#[tokio::test]
async fn test_queues_progress_independently() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;

    let release = Arc::new(tokio::sync::Notify::new());
    let done = Arc::new(AtomicUsize::new(0));
    {
        let release = release.clone();
        service
            .register_processor_fn("ai-processing-queue", move |_job| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(())
                }
            })
            .await
            .unwrap();
    }
    {
        let done = done.clone();
        service
            .register_processor_fn("notification-queue", move |_job| {
                let done = done.clone();
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    service
        .add_job("ai-processing-queue", "ai-processing", &json!({}), JobOptions::new())
        .await
        .unwrap();
    service
        .add_job("notification-queue", "send-notification", &json!({}), JobOptions::new())
        .await
        .unwrap();

    wait_until("notification", || done.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.unacked_count("ai-processing-queue"), 1);

    release.notify_one();
    wait_until("ai job acked", || broker.unacked_count("ai-processing-queue") == 0).await;
}

/// S3. Without options a failing job runs three times, then is dead-lettered
#[tokio::test]
async fn test_default_retry_bound() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn("email-queue", failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();
    service
        .add_job("email-queue", "send-email", &json!({"to": "a@b.com"}), JobOptions::new())
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*attempts.lock(), vec![1, 2, 3]);
    assert_eq!(service.get_queue_count("email-queue").await.unwrap(), 0);
    assert_eq!(service.get_dead_letter_count("email-queue").await.unwrap(), 1);
    assert_eq!(service.metrics().jobs_retried(), 2);
    assert_eq!(service.metrics().jobs_dead_lettered(), 1);
}

/// S4. maxRetries = 1 means a single invocation
#[tokio::test]
async fn test_single_attempt_budget() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn("email-queue", failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();
    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new().with_max_retries(1))
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*attempts.lock(), vec![1]);
}

/// S5. Email job with maxRetries 2: two attempts, then the DLQ with a retries-exhausted event
#[tokio::test]
async fn test_email_job_exhausts_retries() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let mut events = service.events();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn(EMAIL_QUEUE, failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();
    let id = service
        .add_email_job(
            &SendEmail::new("a@b.com", "Welcome"),
            Some(
                JobOptions::new()
                    .with_max_retries(2)
                    .with_retry_delay(Duration::from_millis(10)),
            ),
        )
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*attempts.lock(), vec![1, 2]);

    let dead = broker.ready_messages("email-queue.dlq");
    assert_eq!(dead[0].properties.message_id.as_deref(), Some(id.as_str()));

    let mut names = Vec::new();
    let mut dead_letter = None;
    while let Ok(event) = events.try_recv() {
        names.push(event.event_name());
        if let JobEvent::DeadLettered { job_id, reason, .. } = event {
            dead_letter = Some((job_id, reason));
        }
    }
    assert_eq!(
        names,
        vec!["enqueued", "started", "retrying", "started", "dead_lettered"]
    );
    assert_eq!(dead_letter, Some((Some(id), DeadLetterReason::RetriesExhausted)));
}

/// S6. A permanent error skips the remaining attempts
#[tokio::test]
async fn test_permanent_error_dead_letters_immediately() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn(
            "email-queue",
            failing_processor(attempts.clone(), || JobError::permanent("mailbox does not exist")),
        )
        .await
        .unwrap();
    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new().with_max_retries(5))
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*attempts.lock(), vec![1]);
    assert_eq!(service.metrics().jobs_retried(), 0);
}

/// S7. A body that is not a job envelope goes straight to the DLQ
#[tokio::test]
async fn test_malformed_body_dead_lettered() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        service
            .register_processor_fn("email-queue", move |_job| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
    }

    let channel = broker.connect("memory://other").await.unwrap();
    channel
        .basic_publish(
            "email-queue",
            OutboundMessage {
                body: b"not json".to_vec(),
                properties: MessageProperties::default().with_content_type("application/json"),
            },
        )
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.metrics().jobs_malformed(), 1);
}

/// S8. A delayed job becomes visible only after its delay
#[tokio::test(start_paused = true)]
async fn test_delayed_job_runs_after_delay() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    service
        .register_processor_fn("notification-queue", move |job| {
            let _ = tx.send((job.id.clone(), tokio::time::Instant::now()));
            async { Ok(()) }
        })
        .await
        .unwrap();

    let enqueued_at = tokio::time::Instant::now();
    let id = service
        .add_delayed_job(
            "notification-queue",
            "send-notification",
            &json!({"userId": "u1"}),
            Duration::from_millis(2000),
            JobOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(broker.ready_count("notification-queue"), 0);
    assert_eq!(broker.ready_count("notification-queue.delay.2000"), 1);

    let (ran, at) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ran, id);
    let waited = at - enqueued_at;
    assert!(waited >= Duration::from_millis(2000), "ran after {:?}", waited);
    assert!(waited < Duration::from_millis(2100), "ran after {:?}", waited);
}

/// S9. Asserting topology repeatedly declares each physical queue once
#[tokio::test]
async fn test_topology_is_idempotent() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;

    for _ in 0..2 {
        service
            .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
            .await
            .unwrap();
        service
            .add_delayed_job("email-queue", "send-email", &json!({}), Duration::from_secs(2), JobOptions::new())
            .await
            .unwrap();
    }
    service
        .register_processor_fn("email-queue", |_job| async { Ok(()) })
        .await
        .unwrap();

    assert_eq!(
        broker.queue_names(),
        vec!["email-queue", "email-queue.delay.2000", "email-queue.dlq"]
    );
    let topology = service.topology("email-queue").unwrap();
    assert_eq!(topology.physical_queues().len(), 3);
    assert_eq!(broker.ready_count("email-queue.delay.2000"), 2);
}

/// S10. Retries through delay queues keep the attempt count
#[tokio::test]
async fn test_delay_queue_retry_strategy() {
    let broker = MemoryBroker::new();
    let service = connected_service(
        &broker,
        fast_config().with_retry_strategy(RetryStrategy::DelayQueue),
    )
    .await;
    let attempts = Arc::new(Mutex::new(Vec::new()));
    {
        let attempts = attempts.clone();
        service
            .register_processor_fn("search-index-queue", move |job| {
                attempts.lock().push(job.attempts);
                let result = if job.attempts < 2 {
                    Err(JobError::retryable("index busy"))
                } else {
                    Ok(())
                };
                async move { result }
            })
            .await
            .unwrap();
    }

    service
        .add_job("search-index-queue", "index-document", &json!({}), JobOptions::new())
        .await
        .unwrap();

    wait_until("completion", || service.metrics().jobs_completed() == 1).await;
    assert_eq!(*attempts.lock(), vec![1, 2]);
    assert!(broker.queue_exists("search-index-queue.delay.10"));
    assert_eq!(broker.ready_count("search-index-queue.dlq"), 0);
}

/// S11. A panicking processor counts as a retryable failure
#[tokio::test]
async fn test_panic_is_retried() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));
    {
        let attempts = attempts.clone();
        service
            .register_processor_fn("email-queue", move |job| {
                attempts.lock().push(job.attempts);
                async move {
                    if job.attempts == 1 {
                        panic!("template engine crashed");
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
        .await
        .unwrap();

    wait_until("completion", || service.metrics().jobs_completed() == 1).await;
    assert_eq!(*attempts.lock(), vec![1, 2]);
    assert_eq!(service.active_workers().await, 1);
}

/// S12. Losing the broker fails enqueues until the reconnect, then consumers resume
#[tokio::test]
#[traced_test]
async fn test_reconnect_resumes_consumers() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = processed.clone();
        service
            .register_processor_fn("email-queue", move |_job| {
                processed.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
    }

    service
        .add_job("email-queue", "send-email", &json!({"n": 1}), JobOptions::new())
        .await
        .unwrap();
    wait_until("first job", || processed.load(Ordering::SeqCst) == 1).await;

    broker.set_accepting(false);
    assert_eq!(broker.sever_connections("broker restart"), 1);
    wait_until("disconnect", || !service.is_healthy()).await;

    let result = service
        .add_job("email-queue", "send-email", &json!({"n": 2}), JobOptions::new())
        .await;
    match result {
        Err(e) => assert!(e.is_unavailable(), "unexpected error: {}", e),
        Ok(id) => panic!("enqueue succeeded while disconnected: {}", id),
    }

    broker.set_accepting(true);
    wait_until("reconnect", || service.is_healthy()).await;
    assert!(logs_contain("Broker connection lost, reconnecting"));
    assert!(logs_contain("Reconnected to broker"));

    service
        .add_job("email-queue", "send-email", &json!({"n": 3}), JobOptions::new())
        .await
        .unwrap();
    wait_until("job after reconnect", || processed.load(Ordering::SeqCst) == 2).await;
    assert_eq!(broker.consumer_count("email-queue"), 1);
}

/// S13. Explicit disconnect keeps registrations for the next connect
#[tokio::test]
async fn test_disconnect_then_connect_resumes() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = processed.clone();
        service
            .register_processor_fn("email-queue", move |_job| {
                processed.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
    }

    service.disconnect().await;
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(service.active_workers().await, 0);
    assert!(matches!(
        service
            .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
            .await,
        Err(QueueError::BrokerUnavailable(_))
    ));

    service.connect().await.unwrap();
    assert_eq!(service.registered_queues().await, vec!["email-queue"]);
    assert_eq!(service.active_workers().await, 1);

    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
        .await
        .unwrap();
    wait_until("job", || processed.load(Ordering::SeqCst) == 1).await;
}

/// S14. Registering again swaps the processor
#[tokio::test]
async fn test_reregister_replaces_processor() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    for counter in [first.clone(), second.clone()] {
        service
            .register_processor_fn("email-queue", move |_job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
    }

    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
        .await
        .unwrap();
    wait_until("job", || second.load(Ordering::SeqCst) == 1).await;

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(service.active_workers().await, 1);
    assert_eq!(broker.consumer_count("email-queue"), 1);
}

/// S15. Unregistering stops consumption; messages wait in the queue
#[tokio::test]
async fn test_unregister_stops_consuming() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;

    service
        .register_processor_fn("email-queue", |_job| async { Ok(()) })
        .await
        .unwrap();
    assert!(service.unregister_processor("email-queue").await.unwrap());
    assert!(!service.unregister_processor("email-queue").await.unwrap());
    assert_eq!(broker.consumer_count("email-queue"), 0);

    service
        .add_job("email-queue", "send-email", &json!({}), JobOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.get_queue_count("email-queue").await.unwrap(), 1);
}

/// S16. A router dispatches typed payloads by job type
#[tokio::test]
async fn test_router_dispatches_typed_payloads() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let recipients = Arc::new(Mutex::new(Vec::new()));
    let reasons = Arc::new(Mutex::new(Vec::new()));

    let router = {
        let recipients = recipients.clone();
        JobRouter::new().handle(move |email: SendEmail, _job| {
            recipients.lock().push(email.to);
            async { Ok(()) }
        })
    };
    service.register_processor(EMAIL_QUEUE, router).await.unwrap();

    service.enqueue(&SendEmail::new("a@b.com", "Hi")).await.unwrap();
    service
        .add_job(EMAIL_QUEUE, "send-sms", &json!({}), JobOptions::new())
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*recipients.lock(), vec!["a@b.com".to_string()]);

    let mut events = service.events();
    service
        .add_job(EMAIL_QUEUE, "send-email", &json!({"subject": "missing to"}), JobOptions::new())
        .await
        .unwrap();
    wait_until("bad payload", || broker.ready_count("email-queue.dlq") == 2).await;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::DeadLettered { reason, .. } = event {
            reasons.lock().push(reason);
        }
    }
    assert_eq!(*reasons.lock(), vec![DeadLetterReason::Permanent]);
}

/// S17. Re-registering while a job waits out its retry delay hands the job to the new processor
#[tokio::test]
async fn test_reregister_during_retry_delay() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let failed = Arc::new(Mutex::new(Vec::new()));
    let succeeded = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn("email-queue", failing_processor(failed.clone(), retryable))
        .await
        .unwrap();
    service
        .add_job(
            "email-queue",
            "send-email",
            &json!({}),
            JobOptions::new().with_retry_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    wait_until("first attempt", || failed.lock().len() == 1).await;
    assert_eq!(broker.unacked_count("email-queue"), 1);

    {
        let succeeded = succeeded.clone();
        service
            .register_processor_fn("email-queue", move |job| {
                succeeded.lock().push(job.attempts);
                async { Ok(()) }
            })
            .await
            .unwrap();
    }

    // well before the 60s delay
    wait_until("replacement processor", || succeeded.lock().len() == 1).await;
    assert_eq!(*failed.lock(), vec![1]);
    assert_eq!(*succeeded.lock(), vec![2]);

    wait_until("ack", || broker.unacked_count("email-queue") == 0).await;
    assert_eq!(broker.ready_count("email-queue"), 0);
    assert_eq!(broker.ready_count("email-queue.dlq"), 0);
    assert_eq!(broker.consumer_count("email-queue"), 1);
}

/// S18. Unregistering during a retry delay puts the job back in the queue
#[tokio::test]
async fn test_unregister_during_retry_delay_requeues() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config()).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn("email-queue", failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();
    service
        .add_job(
            "email-queue",
            "send-email",
            &json!({}),
            JobOptions::new().with_retry_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    wait_until("first attempt", || attempts.lock().len() == 1).await;

    assert!(service.unregister_processor("email-queue").await.unwrap());
    assert_eq!(broker.consumer_count("email-queue"), 0);
    assert_eq!(broker.unacked_count("email-queue"), 0);
    assert_eq!(broker.ready_count("email-queue"), 1);
    assert!(broker.ready_messages("email-queue")[0].redelivered);

    // the attempt already made still counts
    service
        .register_processor_fn("email-queue", failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();
    wait_until("second attempt", || attempts.lock().len() == 2).await;
    assert_eq!(*attempts.lock(), vec![1, 2]);
}

/// S19. A message without retry headers uses the configured defaults
#[tokio::test]
async fn test_missing_retry_headers_use_config_defaults() {
    let broker = MemoryBroker::new();
    let service = connected_service(&broker, fast_config().with_default_max_retries(2)).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    service
        .register_processor_fn("email-queue", failing_processor(attempts.clone(), retryable))
        .await
        .unwrap();

    let envelope = JobEnvelope::new("send-email", json!({"to": "a@b.com"}), JobOptions::new());
    let channel = broker.connect("memory://legacy-producer").await.unwrap();
    channel
        .basic_publish(
            "email-queue",
            OutboundMessage {
                body: serde_json::to_vec(&envelope).unwrap(),
                properties: MessageProperties::default()
                    .with_message_id(envelope.id.as_str())
                    .with_content_type("application/json"),
            },
        )
        .await
        .unwrap();

    wait_until("dead letter", || broker.ready_count("email-queue.dlq") == 1).await;
    assert_eq!(*attempts.lock(), vec![1, 2]);
    assert_eq!(service.metrics().jobs_retried(), 1);
}
