use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::types::{JobEnvelope, JobId};

/// Entries untouched for this long are dropped on the next attempt
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct Entry {
    queue: String,
    attempts: u32,
    touched: Instant,
}

/// Highest attempt count seen per in-flight job.
///
/// A broker-native requeue redelivers the body as it was published, so the
/// count stored in the body lags behind. The ledger remembers what this
/// process already counted until the job reaches a terminal decision.
/// Jobs that never come back (purged, or finished by another process) are
/// evicted once idle for longer than the idle timeout.
#[derive(Debug)]
pub struct AttemptLedger {
    entries: Mutex<HashMap<JobId, Entry>>,
    idle_timeout: Duration,
}

impl Default for AttemptLedger {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Advance `envelope.attempts` past anything seen before and remember it
    pub fn begin_attempt(&self, queue: &str, envelope: &mut JobEnvelope) -> u32 {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.evict_idle(&mut entries, now);

        let observed = entries.get(&envelope.id).map_or(0, |entry| entry.attempts);
        let attempt = envelope.begin_attempt(observed);
        entries.insert(
            envelope.id.clone(),
            Entry {
                queue: queue.to_string(),
                attempts: attempt,
                touched: now,
            },
        );
        attempt
    }

    pub fn observed(&self, id: &JobId) -> Option<u32> {
        self.entries.lock().get(id).map(|entry| entry.attempts)
    }

    /// Drop the entry once the job is acked, dead-lettered or republished
    pub fn forget(&self, id: &JobId) {
        self.entries.lock().remove(id);
    }

    /// Drop every entry of `queue`, e.g. after its messages were purged
    pub fn forget_queue(&self, queue: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.queue != queue);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_idle(&self, entries: &mut HashMap<JobId, Entry>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.touched) < self.idle_timeout);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle attempt counts");
        }
    }
}
