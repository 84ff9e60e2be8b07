use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backend::{CloseReason, Delivery, HeaderValue, MessageProperties, QueueArguments};
use crate::types::DeliveryTag;

pub(crate) type ConnectionId = u64;

pub const X_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const X_FIRST_DEATH_REASON: &str = "x-first-death-reason";

/// A message sitting in a queue
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    pub(crate) expires_at: Option<Instant>,
}

impl StoredMessage {
    pub(crate) fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            body,
            properties,
            redelivered: false,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConsumerKey {
    pub connection: ConnectionId,
    pub tag: String,
}

pub(crate) struct QueueState {
    pub arguments: QueueArguments,
    pub ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerKey>,
    next_consumer: usize,
}

impl QueueState {
    fn new(arguments: QueueArguments) -> Self {
        Self {
            arguments,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct ConsumerState {
    queue: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

pub(crate) struct Unacked {
    connection: ConnectionId,
    consumer: ConsumerKey,
    queue: String,
    message: StoredMessage,
}

/// Whole-broker state, guarded by one mutex so every operation is atomic
pub(crate) struct BrokerState {
    pub queues: HashMap<String, QueueState>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    connections: HashMap<ConnectionId, watch::Sender<Option<CloseReason>>>,
    next_delivery_tag: DeliveryTag,
    next_connection: ConnectionId,
    /// Expiry deadlines created by the last operation, drained by the caller
    timers: Vec<(String, Instant)>,
}

impl BrokerState {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            consumers: HashMap::new(),
            unacked: HashMap::new(),
            connections: HashMap::new(),
            next_delivery_tag: 1,
            next_connection: 1,
            timers: Vec::new(),
        }
    }

    pub fn open_connection(&mut self) -> (ConnectionId, watch::Receiver<Option<CloseReason>>) {
        let id = self.next_connection;
        self.next_connection += 1;
        let (tx, rx) = watch::channel(None);
        self.connections.insert(id, tx);
        (id, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    pub fn take_timers(&mut self) -> Vec<(String, Instant)> {
        std::mem::take(&mut self.timers)
    }

    pub fn declare(&mut self, name: &str, arguments: &QueueArguments) -> Result<bool, String> {
        match self.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => Err(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                name
            )),
            Some(_) => Ok(false),
            None => {
                self.queues.insert(name.to_string(), QueueState::new(arguments.clone()));
                Ok(true)
            }
        }
    }

    pub fn publish(&mut self, name: &str, message: StoredMessage) -> Result<(), String> {
        if !self.queues.contains_key(name) {
            return Err(format!("NOT_FOUND - no queue '{}'", name));
        }
        self.push_back(name, message);
        self.dispatch(name);
        Ok(())
    }

    fn push_back(&mut self, name: &str, mut message: StoredMessage) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        message.expires_at = queue
            .arguments
            .message_ttl_ms
            .map(|ttl| Instant::now() + Duration::from_millis(ttl));
        if let Some(at) = message.expires_at {
            self.timers.push((name.to_string(), at));
        }
        queue.ready.push_back(message);
    }

    pub fn consume(
        &mut self,
        connection: ConnectionId,
        name: &str,
        tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, String> {
        let key = ConsumerKey {
            connection,
            tag: tag.to_string(),
        };
        if self.consumers.contains_key(&key) {
            return Err(format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", tag));
        }
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| format!("NOT_FOUND - no queue '{}'", name))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(key.clone());
        self.consumers.insert(
            key,
            ConsumerState {
                queue: name.to_string(),
                prefetch,
                in_flight: 0,
                sender,
            },
        );
        self.dispatch(name);
        Ok(receiver)
    }

    pub fn cancel(&mut self, connection: ConnectionId, tag: &str) -> bool {
        let key = ConsumerKey {
            connection,
            tag: tag.to_string(),
        };
        self.remove_consumer(&key)
    }

    fn remove_consumer(&mut self, key: &ConsumerKey) -> bool {
        match self.consumers.remove(key) {
            Some(consumer) => {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.consumers.retain(|k| k != key);
                }
                true
            }
            None => false,
        }
    }

    pub fn ack(&mut self, connection: ConnectionId, tag: DeliveryTag) -> Result<(), String> {
        let unacked = self.settle(connection, tag)?;
        self.dispatch(&unacked.queue);
        Ok(())
    }

    pub fn nack(&mut self, connection: ConnectionId, tag: DeliveryTag, requeue: bool) -> Result<(), String> {
        let unacked = self.settle(connection, tag)?;
        let queue = unacked.queue.clone();
        if requeue {
            self.requeue_front(&queue, unacked.message);
        } else {
            self.dead_letter(&queue, unacked.message, "rejected");
        }
        self.dispatch(&queue);
        Ok(())
    }

    fn settle(&mut self, connection: ConnectionId, tag: DeliveryTag) -> Result<Unacked, String> {
        match self.unacked.get(&tag) {
            Some(unacked) if unacked.connection == connection => {}
            _ => return Err(format!("PRECONDITION_FAILED - unknown delivery tag {}", tag)),
        }
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| format!("PRECONDITION_FAILED - unknown delivery tag {}", tag))?;
        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }

    fn requeue_front(&mut self, name: &str, mut message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(name) {
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    /// Route a message through the queue's dead-letter arguments.
    /// Unroutable dead letters are dropped, as the broker would.
    fn dead_letter(&mut self, source: &str, mut message: StoredMessage, reason: &str) {
        let Some(arguments) = self.queues.get(source).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(target) = arguments.dead_letter_routing_key else {
            debug!(queue = %source, reason, "Dropping message without dead-letter routing");
            return;
        };
        if arguments.dead_letter_exchange.as_deref().map_or(false, |e| !e.is_empty()) {
            warn!(queue = %source, "Only the default exchange is routable in memory; dropping dead letter");
            return;
        }
        if !self.queues.contains_key(&target) {
            warn!(queue = %source, target = %target, "Dead-letter target queue missing; dropping message");
            return;
        }

        let headers = &mut message.properties.headers;
        headers
            .entry(X_FIRST_DEATH_QUEUE.to_string())
            .or_insert_with(|| HeaderValue::from(source));
        headers
            .entry(X_FIRST_DEATH_REASON.to_string())
            .or_insert_with(|| HeaderValue::from(reason));
        message.redelivered = false;

        self.push_back(&target, message);
        self.dispatch(&target);
    }

    /// Dead-letter every expired message at the head of `name`
    pub fn expire_due(&mut self, name: &str, now: Instant) -> usize {
        let mut expired = Vec::new();
        if let Some(queue) = self.queues.get_mut(name) {
            while queue.ready.front().map_or(false, |m| m.is_expired(now)) {
                if let Some(message) = queue.ready.pop_front() {
                    expired.push(message);
                }
            }
        }
        let count = expired.len();
        for message in expired {
            self.dead_letter(name, message, "expired");
        }
        count
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Hand ready messages to consumers with spare prefetch capacity
    fn dispatch(&mut self, name: &str) {
        self.expire_due(name, Instant::now());

        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (queue.next_consumer + offset) % count;
                let key = &queue.consumers[index];
                if self.consumers.get(key).map_or(false, ConsumerState::has_capacity) {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                return;
            };
            queue.next_consumer = (index + 1) % count;
            let key = queue.consumers[index].clone();
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            let sent = match self.consumers.get_mut(&key) {
                Some(consumer) => match consumer.sender.send(delivery) {
                    Ok(()) => {
                        consumer.in_flight += 1;
                        true
                    }
                    Err(_) => false,
                },
                None => false,
            };

            if !sent {
                // receiver dropped without cancelling: forget the consumer, keep the message
                if let Some(queue) = self.queues.get_mut(name) {
                    queue.ready.push_front(message);
                }
                self.remove_consumer(&key);
                continue;
            }

            self.next_delivery_tag += 1;
            self.unacked.insert(
                tag,
                Unacked {
                    connection: key.connection,
                    consumer: key,
                    queue: name.to_string(),
                    message,
                },
            );
        }
    }

    /// Tear down a connection: cancel its consumers and requeue whatever it
    /// had not settled, in original order
    pub fn close_connection(&mut self, connection: ConnectionId, reason: CloseReason) -> bool {
        let Some(signal) = self.connections.remove(&connection) else {
            return false;
        };

        let keys: Vec<ConsumerKey> = self
            .consumers
            .keys()
            .filter(|k| k.connection == connection)
            .cloned()
            .collect();
        for key in &keys {
            self.remove_consumer(key);
        }

        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue.clone());
                }
                self.requeue_front(&unacked.queue, unacked.message);
            }
        }

        let _ = signal.send(Some(reason));

        for queue in touched {
            self.dispatch(&queue);
        }
        true
    }

    pub fn ready_count(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|q| q.ready.len())
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        self.unacked.values().filter(|u| u.queue == name).count()
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.consumers.len())
    }

    pub fn purge(&mut self, name: &str) -> Option<usize> {
        self.queues.get_mut(name).map(|queue| {
            let removed = queue.ready.len();
            queue.ready.clear();
            removed
        })
    }
}
