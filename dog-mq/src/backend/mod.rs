#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use futures_core::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::{QueueResult, types::{ConsumerTag, DeliveryTag}};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Deliveries pushed by the broker to one consumer. Ends when the consumer
/// is cancelled or the underlying connection goes away.
pub type DeliveryStream = BoxStream<Delivery>;

pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const X_MESSAGE_TTL: &str = "x-message-ttl";

/// Header value subset the queue relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl HeaderValue {
    /// Integer view; numeric strings are accepted since some clients stringify headers
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Str(value) => value.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        Self::Int(value.min(i64::MAX as u64) as i64)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Basic message properties carried alongside a body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Survive a broker restart (AMQP delivery mode 2)
    pub persistent: bool,
    /// Unix seconds
    pub timestamp: Option<i64>,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }
}

/// A message about to be published
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message delivered to a consumer and awaiting ack/nack
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Declaration arguments for a durable queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

impl QueueArguments {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Route rejected/expired messages through the default exchange to `queue`
    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(String::new());
        self.dead_letter_routing_key = Some(queue.into());
        self
    }

    pub fn message_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    /// The `x-*` argument table as sent to the broker
    pub fn table(&self) -> Headers {
        let mut table = Headers::new();
        if let Some(exchange) = &self.dead_letter_exchange {
            table.insert(X_DEAD_LETTER_EXCHANGE.to_string(), exchange.clone().into());
        }
        if let Some(key) = &self.dead_letter_routing_key {
            table.insert(X_DEAD_LETTER_ROUTING_KEY.to_string(), key.clone().into());
        }
        if let Some(ttl) = self.message_ttl_ms {
            table.insert(X_MESSAGE_TTL.to_string(), ttl.into());
        }
        table
    }
}

/// Why a channel stopped being usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this process via `close()`
    Requested,
    /// Closed by the broker or the network
    Broker(String),
}

/// Opens broker connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and open the single channel used for every operation
    async fn connect(&self, url: &str) -> QueueResult<Arc<dyn BrokerChannel>>;

    /// Short transport name for logs
    fn name(&self) -> &'static str;
}

/// One connection plus its channel. Implementations serialize operations
/// internally, so a channel may be shared between tasks.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap unacknowledged deliveries per consumer created after this call
    async fn basic_qos(&self, prefetch: u16) -> QueueResult<()>;

    /// Create the queue if absent; redeclaring with the same arguments is a no-op
    async fn queue_declare(&self, queue: &str, arguments: &QueueArguments) -> QueueResult<()>;

    /// Publish through the default exchange with `queue` as routing key
    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> QueueResult<()>;

    /// Start a manual-ack consumer
    async fn basic_consume(&self, queue: &str, consumer_tag: &ConsumerTag) -> QueueResult<DeliveryStream>;

    async fn basic_cancel(&self, consumer_tag: &ConsumerTag) -> QueueResult<()>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> QueueResult<()>;

    /// Reject a delivery; without requeue the queue's dead-letter routing applies
    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> QueueResult<()>;

    /// Messages ready for delivery (excludes unacknowledged ones)
    async fn message_count(&self, queue: &str) -> QueueResult<u32>;

    /// Drop all ready messages, returning how many were removed
    async fn queue_purge(&self, queue: &str) -> QueueResult<u32>;

    /// Close the channel, then the connection
    async fn close(&self) -> QueueResult<()>;

    /// Resolves once the channel is closed, for whatever reason
    async fn wait_closed(&self) -> CloseReason;

    fn is_open(&self) -> bool;
}
