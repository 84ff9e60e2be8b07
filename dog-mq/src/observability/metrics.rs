use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::types::DeadLetterReason;

/// Live counters for queue operations
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_malformed: AtomicU64,

    // Per-queue metrics
    queue_metrics: Arc<RwLock<HashMap<String, QueueMetrics>>>,

    performance: Arc<RwLock<PerformanceMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            jobs_malformed: AtomicU64::new(0),
            queue_metrics: Arc::new(RwLock::new(HashMap::new())),
            performance: Arc::new(RwLock::new(PerformanceMetrics::new())),
        }
    }

    fn update_queue(&self, queue: &str, update: impl FnOnce(&mut QueueMetrics)) {
        let mut metrics = self.queue_metrics.write();
        update(metrics.entry(queue.to_string()).or_default());
    }

    pub fn increment_jobs_enqueued(&self, queue: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.update_queue(queue, |m| m.enqueued += 1);
    }

    pub fn increment_jobs_started(&self, queue: &str) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        self.update_queue(queue, |m| m.started += 1);
    }

    pub fn increment_jobs_completed(&self, queue: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.update_queue(queue, |m| m.completed += 1);
    }

    pub fn increment_jobs_retried(&self, queue: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.update_queue(queue, |m| m.retried += 1);
    }

    pub fn increment_jobs_dead_lettered(&self, queue: &str, reason: DeadLetterReason) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
        if reason == DeadLetterReason::Malformed {
            self.jobs_malformed.fetch_add(1, Ordering::Relaxed);
        }
        self.update_queue(queue, |m| m.dead_lettered += 1);
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn jobs_malformed(&self) -> u64 {
        self.jobs_malformed.load(Ordering::Relaxed)
    }

    pub fn queue_metrics(&self, queue: &str) -> Option<QueueMetrics> {
        self.queue_metrics.read().get(queue).cloned()
    }

    pub fn all_queue_metrics(&self) -> HashMap<String, QueueMetrics> {
        self.queue_metrics.read().clone()
    }

    /// Record handler execution time for a queue
    pub fn record_execution_time(&self, queue: &str, duration: Duration) {
        self.performance.write().record_execution_time(queue, duration);
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.performance.read().clone()
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one logical queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl QueueMetrics {
    /// Share of finished jobs that completed, as a percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }

    /// Failed attempts that were retried, per started attempt
    pub fn retry_rate(&self) -> f64 {
        if self.started == 0 {
            0.0
        } else {
            (self.retried as f64 / self.started as f64) * 100.0
        }
    }
}

/// Handler execution times per queue
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    execution_times: HashMap<String, Vec<Duration>>,
    last_updated: DateTime<Utc>,
}

impl PerformanceMetrics {
    const MAX_SAMPLES: usize = 1000;

    pub fn new() -> Self {
        Self {
            execution_times: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn record_execution_time(&mut self, queue: &str, duration: Duration) {
        let times = self.execution_times.entry(queue.to_string()).or_default();
        times.push(duration);

        if times.len() > Self::MAX_SAMPLES {
            times.remove(0);
        }

        self.last_updated = Utc::now();
    }

    pub fn average_execution_time(&self, queue: &str) -> Option<Duration> {
        let times = self.execution_times.get(queue)?;
        if times.is_empty() {
            return None;
        }

        let total: Duration = times.iter().sum();
        Some(total / times.len() as u32)
    }

    pub fn percentile_execution_time(&self, queue: &str, percentile: f64) -> Option<Duration> {
        let times = self.execution_times.get(queue)?;
        if times.is_empty() {
            return None;
        }

        let mut sorted = times.clone();
        sorted.sort();

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted.get(index).copied()
    }

    pub fn queues(&self) -> Vec<String> {
        self.execution_times.keys().cloned().collect()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds point-in-time snapshots from live counters
pub struct MetricsCollector {
    live_metrics: Arc<LiveMetrics>,
}

impl MetricsCollector {
    pub fn new(live_metrics: Arc<LiveMetrics>) -> Self {
        Self { live_metrics }
    }

    pub fn collect_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_enqueued: self.live_metrics.jobs_enqueued(),
                jobs_started: self.live_metrics.jobs_started(),
                jobs_completed: self.live_metrics.jobs_completed(),
                jobs_retried: self.live_metrics.jobs_retried(),
                jobs_dead_lettered: self.live_metrics.jobs_dead_lettered(),
                jobs_malformed: self.live_metrics.jobs_malformed(),
            },
            queues: self.live_metrics.all_queue_metrics(),
            performance: self.live_metrics.performance_metrics(),
        }
    }

    pub fn live_metrics(&self) -> &LiveMetrics {
        &self.live_metrics
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub queues: HashMap<String, QueueMetrics>,
    pub performance: PerformanceMetrics,
}

#[derive(Debug, Clone)]
pub struct GlobalMetrics {
    pub jobs_enqueued: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_malformed: u64,
}

impl GlobalMetrics {
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.jobs_completed as f64 / finished as f64) * 100.0
        }
    }

    pub fn dead_letter_rate(&self) -> f64 {
        if self.jobs_enqueued == 0 {
            0.0
        } else {
            (self.jobs_dead_lettered as f64 / self.jobs_enqueued as f64) * 100.0
        }
    }

    /// Jobs enqueued but not yet completed or dead-lettered
    pub fn jobs_outstanding(&self) -> u64 {
        self.jobs_enqueued
            .saturating_sub(self.jobs_completed + self.jobs_dead_lettered)
    }
}
