use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument};

use crate::backend::QueueArguments;
use crate::connection::BrokerConnection;
use crate::{QueueError, QueueResult};

pub const DEAD_LETTER_SUFFIX: &str = ".dlq";
pub const DELAY_INFIX: &str = ".delay.";

/// `<queue>.dlq`
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// `<queue>.delay.<ms>`
pub fn delay_queue_name(queue: &str, delay_ms: u64) -> String {
    format!("{}{}{}", queue, DELAY_INFIX, delay_ms)
}

/// Physical queues behind one logical queue name, as asserted so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub name: String,
    pub dead_letter: String,
    /// Delay values (ms) that have a delay queue
    pub delays: BTreeSet<u64>,
}

impl QueueTopology {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dead_letter: dead_letter_queue_name(name),
            delays: BTreeSet::new(),
        }
    }

    pub fn delay_queue_names(&self) -> Vec<String> {
        self.delays
            .iter()
            .map(|delay| delay_queue_name(&self.name, *delay))
            .collect()
    }

    /// Main, dead-letter, then delay queues
    pub fn physical_queues(&self) -> Vec<String> {
        let mut queues = vec![self.name.clone(), self.dead_letter.clone()];
        queues.extend(self.delay_queue_names());
        queues
    }
}

/// Main queue: durable, rejected messages go to `<queue>.dlq`
pub fn main_queue_arguments(queue: &str) -> QueueArguments {
    QueueArguments::durable().dead_letter_to(dead_letter_queue_name(queue))
}

/// Delay queue: durable, messages move back to the main queue when the TTL expires
pub fn delay_queue_arguments(queue: &str, delay_ms: u64) -> QueueArguments {
    QueueArguments::durable()
        .message_ttl(delay_ms)
        .dead_letter_to(queue)
}

/// Asserts queue topology through the shared broker channel.
///
/// Declarations are "create if absent", so every call goes to the broker;
/// the local map only records what has been asserted for introspection.
pub struct TopologyManager {
    connection: BrokerConnection,
    known: RwLock<HashMap<String, QueueTopology>>,
}

impl TopologyManager {
    pub fn new(connection: BrokerConnection) -> Self {
        Self {
            connection,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Assert `<queue>.dlq` and then `<queue>` with dead-letter routing to it
    #[instrument(skip(self))]
    pub async fn ensure_queue(&self, queue: &str) -> QueueResult<QueueTopology> {
        validate_queue_name(queue)?;
        let channel = self.connection.channel()?;

        let dead_letter = dead_letter_queue_name(queue);
        channel
            .queue_declare(&dead_letter, &QueueArguments::durable())
            .await?;
        channel
            .queue_declare(queue, &main_queue_arguments(queue))
            .await?;

        let mut known = self.known.write();
        let topology = known
            .entry(queue.to_string())
            .or_insert_with(|| {
                debug!(queue, "Queue topology asserted");
                QueueTopology::new(queue)
            })
            .clone();
        Ok(topology)
    }

    /// Assert the delay queue for `delay_ms` and return its name
    #[instrument(skip(self))]
    pub async fn ensure_delay_queue(&self, queue: &str, delay_ms: u64) -> QueueResult<String> {
        validate_queue_name(queue)?;
        if delay_ms == 0 {
            return Err(QueueError::topology(queue, "delay queue needs a delay greater than zero"));
        }
        let channel = self.connection.channel()?;

        let name = delay_queue_name(queue, delay_ms);
        channel
            .queue_declare(&name, &delay_queue_arguments(queue, delay_ms))
            .await?;

        let mut known = self.known.write();
        let inserted = known
            .entry(queue.to_string())
            .or_insert_with(|| QueueTopology::new(queue))
            .delays
            .insert(delay_ms);
        if inserted {
            debug!(queue, delay_ms, "Delay queue asserted");
        }
        Ok(name)
    }

    /// What has been asserted for `queue` in this process
    pub fn topology(&self, queue: &str) -> Option<QueueTopology> {
        self.known.read().get(queue).cloned()
    }

    pub fn known_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.known.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }
}

fn validate_queue_name(queue: &str) -> QueueResult<()> {
    if queue.trim().is_empty() {
        return Err(QueueError::topology(queue, "queue name must not be empty"));
    }
    if queue.len() > 200 {
        // leaves room for the .dlq / .delay.<ms> suffixes under the AMQP 255-byte limit
        return Err(QueueError::topology(queue, "queue name is too long"));
    }
    Ok(())
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBroker;
    use crate::backend::{X_DEAD_LETTER_ROUTING_KEY, X_MESSAGE_TTL};
    use std::sync::Arc;
    use std::time::Duration;

    async fn connected(broker: &MemoryBroker) -> TopologyManager {
        let connection = BrokerConnection::new(
            Arc::new(broker.clone()),
            Some("memory://local".to_string()),
            1,
            Duration::from_millis(20),
        );
        connection.connect().await.unwrap();
        TopologyManager::new(connection)
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(dead_letter_queue_name("email-queue"), "email-queue.dlq");
        assert_eq!(delay_queue_name("email-queue", 2000), "email-queue.delay.2000");
    }

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let broker = MemoryBroker::new();
        let topology = connected(&broker).await;

        for _ in 0..5 {
            topology.ensure_queue("email-queue").await.unwrap();
        }

        assert_eq!(broker.queue_names(), vec!["email-queue", "email-queue.dlq"]);
        let args = broker.queue_arguments("email-queue").unwrap();
        assert!(args.durable);
        assert_eq!(
            args.table().get(X_DEAD_LETTER_ROUTING_KEY).and_then(|v| v.as_str()),
            Some("email-queue.dlq")
        );
        assert_eq!(topology.known_queues(), vec!["email-queue"]);
    }

    #[tokio::test]
    async fn test_delay_queue_routes_back_to_main() {
        let broker = MemoryBroker::new();
        let topology = connected(&broker).await;

        topology.ensure_queue("search-index-queue").await.unwrap();
        let name = topology.ensure_delay_queue("search-index-queue", 1500).await.unwrap();
        topology.ensure_delay_queue("search-index-queue", 1500).await.unwrap();

        assert_eq!(name, "search-index-queue.delay.1500");
        let table = broker.queue_arguments(&name).unwrap().table();
        assert_eq!(table.get(X_MESSAGE_TTL).and_then(|v| v.as_i64()), Some(1500));
        assert_eq!(
            table.get(X_DEAD_LETTER_ROUTING_KEY).and_then(|v| v.as_str()),
            Some("search-index-queue")
        );

        let recorded = topology.topology("search-index-queue").unwrap();
        assert_eq!(
            recorded.physical_queues(),
            vec![
                "search-index-queue",
                "search-index-queue.dlq",
                "search-index-queue.delay.1500"
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_queue_without_channel_is_unavailable() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::new(
            Arc::new(broker.clone()),
            None,
            1,
            Duration::from_millis(20),
        );
        let topology = TopologyManager::new(connection);

        let result = topology.ensure_queue("email-queue").await;
        assert!(matches!(result, Err(QueueError::BrokerUnavailable(_))));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let broker = MemoryBroker::new();
        let topology = connected(&broker).await;

        assert!(matches!(
            topology.ensure_queue("").await,
            Err(QueueError::Topology { .. })
        ));
        assert!(topology.ensure_delay_queue("email-queue", 0).await.is_err());
    }
}
