//! In-process broker with AMQP queue semantics.
//!
//! Queues are durable for the lifetime of the [`MemoryBroker`] value and
//! outlive the connections made to it, so a reconnect finds its topology
//! and messages where it left them. Dead-letter routing, per-queue TTL,
//! per-consumer prefetch and requeue-on-connection-loss behave like a
//! RabbitMQ default exchange.

pub mod reaper;
pub mod storage;

pub use reaper::ExpiryReaper;
pub use storage::{StoredMessage, X_FIRST_DEATH_QUEUE, X_FIRST_DEATH_REASON};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::backend::{
    BrokerChannel, CloseReason, DeliveryStream, OutboundMessage, QueueArguments, Transport,
};
use crate::types::{ConsumerTag, DeliveryTag};
use crate::{QueueError, QueueResult};
use storage::{BrokerState, ConnectionId};

pub(crate) struct BrokerInner {
    state: Mutex<BrokerState>,
    accepting: AtomicBool,
}

impl BrokerInner {
    /// Run `f` under the state lock, then arm any expiry timers it created
    fn with_state<R>(self: &Arc<Self>, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let (result, timers) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.take_timers())
        };
        if !timers.is_empty() && tokio::runtime::Handle::try_current().is_ok() {
            let reaper = ExpiryReaper::new(self);
            for (queue, at) in timers {
                reaper.schedule(queue, at);
            }
        }
        result
    }

    pub(crate) fn expire_queue(self: &Arc<Self>, queue: &str) -> usize {
        self.with_state(|state| state.expire_due(queue, Instant::now()))
    }

    pub(crate) fn expire_all(self: &Arc<Self>) -> usize {
        self.with_state(|state| {
            let now = Instant::now();
            state
                .queue_names()
                .iter()
                .map(|name| state.expire_due(name, now))
                .sum()
        })
    }
}

/// In-memory broker for tests, local development and single-process deployments
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Refuse (`false`) or accept (`true`) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Close every open connection from the broker side, as a restart or
    /// network partition would. Returns how many connections were closed.
    pub fn sever_connections(&self, reason: &str) -> usize {
        let closed = self.inner.with_state(|state| {
            state
                .connection_ids()
                .into_iter()
                .filter(|id| state.close_connection(*id, CloseReason::Broker(reason.to_string())))
                .count()
        });
        info!(closed, reason, "Memory broker severed connections");
        closed
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connection_count()
    }

    /// Names of all declared queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names = self.inner.state.lock().queue_names();
        names.sort();
        names
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.inner.state.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Snapshot of the ready (undelivered) messages of a queue, head first
    pub fn ready_messages(&self, name: &str) -> Vec<StoredMessage> {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, name: &str) -> usize {
        self.inner.state.lock().ready_count(name).unwrap_or(0)
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        self.inner.state.lock().unacked_count(name)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner.state.lock().consumer_count(name)
    }

    /// Expiry reaper bound to this broker
    pub fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(&self.inner)
    }

    /// Run one expiry sweep now (for testing)
    pub fn run_reaper_tick(&self) -> usize {
        self.reaper().reap_expired()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, url: &str) -> QueueResult<Arc<dyn BrokerChannel>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::BrokerUnavailable(format!(
                "connection to {} refused",
                url
            )));
        }

        let (connection, closed) = self.inner.state.lock().open_connection();
        debug!(connection, url, "Memory broker connection opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.inner.clone(),
            connection,
            prefetch: AtomicU16::new(0),
            closed,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Channel on a [`MemoryBroker`] connection
pub struct MemoryChannel {
    broker: Arc<BrokerInner>,
    connection: ConnectionId,
    prefetch: AtomicU16,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl MemoryChannel {
    /// Run `f` only while this channel's connection is open
    fn open_op<R>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> QueueResult<R>,
    ) -> QueueResult<R> {
        let connection = self.connection;
        self.broker.with_state(|state| {
            if !state.is_open(connection) {
                return Err(QueueError::BrokerUnavailable("channel is closed".to_string()));
            }
            f(state)
        })
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch: u16) -> QueueResult<()> {
        self.open_op(|_| Ok(()))?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, arguments: &QueueArguments) -> QueueResult<()> {
        let created = self.open_op(|state| {
            state
                .declare(queue, arguments)
                .map_err(|e| QueueError::topology(queue, e))
        })?;
        if created {
            debug!(queue, arguments = ?arguments.table(), "Declared queue");
        }
        Ok(())
    }

    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> QueueResult<()> {
        self.open_op(|state| {
            state
                .publish(queue, StoredMessage::new(message.body, message.properties))
                .map_err(|e| QueueError::publish(queue, e))
        })
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &ConsumerTag) -> QueueResult<DeliveryStream> {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let connection = self.connection;
        let receiver = self.open_op(|state| {
            state
                .consume(connection, queue, consumer_tag.as_str(), prefetch)
                .map_err(|e| QueueError::topology(queue, e))
        })?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn basic_cancel(&self, consumer_tag: &ConsumerTag) -> QueueResult<()> {
        let connection = self.connection;
        self.open_op(|state| {
            state.cancel(connection, consumer_tag.as_str());
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> QueueResult<()> {
        let connection = self.connection;
        self.open_op(|state| state.ack(connection, delivery_tag).map_err(QueueError::Internal))
    }

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> QueueResult<()> {
        let connection = self.connection;
        self.open_op(|state| {
            state
                .nack(connection, delivery_tag, requeue)
                .map_err(QueueError::Internal)
        })
    }

    async fn message_count(&self, queue: &str) -> QueueResult<u32> {
        self.open_op(|state| {
            state
                .ready_count(queue)
                .map(|count| count as u32)
                .ok_or_else(|| QueueError::topology(queue, "NOT_FOUND - no queue"))
        })
    }

    async fn queue_purge(&self, queue: &str) -> QueueResult<u32> {
        self.open_op(|state| {
            state
                .purge(queue)
                .map(|count| count as u32)
                .ok_or_else(|| QueueError::topology(queue, "NOT_FOUND - no queue"))
        })
    }

    async fn close(&self) -> QueueResult<()> {
        let connection = self.connection;
        self.broker
            .with_state(|state| state.close_connection(connection, CloseReason::Requested));
        Ok(())
    }

    async fn wait_closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        let observed = closed
            .wait_for(|reason| reason.is_some())
            .await
            .ok()
            .and_then(|reason| reason.clone());
        observed.unwrap_or_else(|| CloseReason::Broker("connection dropped".to_string()))
    }

    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }
}
