use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info};

use super::BrokerInner;

/// Dead-letters messages whose queue TTL has elapsed.
///
/// Every publish into a TTL queue schedules a one-shot wake-up at the
/// message's deadline; `reap_expired` can also be driven on an interval.
pub struct ExpiryReaper {
    broker: Weak<BrokerInner>,
}

impl ExpiryReaper {
    pub(crate) fn new(broker: &Arc<BrokerInner>) -> Self {
        Self {
            broker: Arc::downgrade(broker),
        }
    }

    /// Wake up at `at` and expire the head of `queue`
    pub(crate) fn schedule(&self, queue: String, at: Instant) {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            sleep_until(at).await;
            if let Some(broker) = broker.upgrade() {
                let expired = broker.expire_queue(&queue);
                if expired > 0 {
                    debug!(queue = %queue, expired, "Expired messages dead-lettered");
                }
            }
        });
    }

    /// Run one reaper cycle over every queue
    pub fn reap_expired(&self) -> usize {
        match self.broker.upgrade() {
            Some(broker) => broker.expire_all(),
            None => 0,
        }
    }

    /// Periodic sweep until the broker is dropped
    pub async fn start(self, period: Duration) {
        let mut ticker = interval(period);

        info!("Starting expiry reaper with interval: {:?}", period);

        loop {
            ticker.tick().await;
            if self.broker.strong_count() == 0 {
                break;
            }
            let reaped = self.reap_expired();
            if reaped > 0 {
                info!("Reaped {} expired messages", reaped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::memory::MemoryBroker;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_stops_with_broker() {
        let broker = MemoryBroker::new();
        let sweep = tokio::spawn(broker.reaper().start(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!sweep.is_finished());

        drop(broker);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sweep.is_finished());
    }
}
