//! RabbitMQ transport over `lapin`.

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{
    BrokerChannel, CloseReason, Delivery, DeliveryStream, HeaderValue, Headers, MessageProperties,
    OutboundMessage, QueueArguments, Transport,
};
use crate::types::{ConsumerTag, DeliveryTag};
use crate::{QueueError, QueueResult};

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to an AMQP 0.9.1 broker
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport {
    connection_name: Option<String>,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker management UI
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, url: &str) -> QueueResult<Arc<dyn BrokerChannel>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(LongString::from(name.as_str()));
        }

        let connection = Connection::connect(url, properties)
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;

        let (closed_tx, closed) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        {
            let closed_tx = closed_tx.clone();
            connection.on_error(move |error| {
                warn!("AMQP connection error: {}", error);
                mark_closed(&closed_tx, CloseReason::Broker(error.to_string()));
            });
        }
        // Channel exceptions (PRECONDITION_FAILED, NOT_FOUND, unknown delivery tag)
        // close only the channel; the connection stays up and reports nothing.
        {
            let closed_tx = closed_tx.clone();
            channel.on_error(move |error| {
                warn!("AMQP channel error: {}", error);
                mark_closed(&closed_tx, CloseReason::Broker(format!("channel closed: {}", error)));
            });
        }

        debug!("AMQP channel {} opened", channel.id());
        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            closed_tx,
            closed,
        }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// One `lapin` connection with its single channel
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl AmqpChannel {
    fn unavailable(&self, error: lapin::Error) -> QueueError {
        self.note_failure(&error);
        QueueError::BrokerUnavailable(error.to_string())
    }

    /// A failed operation that left the channel dead closes the whole handle,
    /// so the connection monitor replaces it
    fn note_failure(&self, error: &lapin::Error) {
        if !self.channel.status().connected() {
            mark_closed(&self.closed_tx, CloseReason::Broker(format!("channel closed: {}", error)));
        }
    }

    fn topology_error(&self, queue: &str, error: lapin::Error) -> QueueError {
        self.note_failure(&error);
        QueueError::topology(queue, error)
    }

    fn publish_error(&self, queue: &str, error: lapin::Error) -> QueueError {
        self.note_failure(&error);
        QueueError::publish(queue, error)
    }
}

fn check_confirmation(queue: &str, confirmation: &Confirmation) -> QueueResult<()> {
    if confirmation.is_nack() {
        return Err(QueueError::publish(queue, "broker rejected the message"));
    }
    Ok(())
}

fn mark_closed(closed_tx: &watch::Sender<Option<CloseReason>>, cause: CloseReason) {
    closed_tx.send_if_modified(|reason| {
        if reason.is_none() {
            *reason = Some(cause);
            true
        } else {
            false
        }
    });
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn basic_qos(&self, prefetch: u16) -> QueueResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn queue_declare(&self, queue: &str, arguments: &QueueArguments) -> QueueResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: arguments.durable,
                    ..QueueDeclareOptions::default()
                },
                field_table(&arguments.table()),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.topology_error(queue, e))
    }

    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> QueueResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|e| self.publish_error(queue, e))?;
        let confirmation = confirm.await.map_err(|e| self.publish_error(queue, e))?;
        check_confirmation(queue, &confirmation)
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &ConsumerTag) -> QueueResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.topology_error(queue, e))?;

        let closed_tx = self.closed_tx.clone();
        let deliveries = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    warn!("AMQP consumer ended: {}", e);
                    mark_closed(&closed_tx, CloseReason::Broker(format!("consumer failed: {}", e)));
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| {
                future::ready(item.ok().map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    properties: message_properties(&delivery.properties),
                    body: delivery.data,
                }))
            });

        Ok(Box::pin(deliveries))
    }

    async fn basic_cancel(&self, consumer_tag: &ConsumerTag) -> QueueResult<()> {
        self.channel
            .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> QueueResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> QueueResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn message_count(&self, queue: &str) -> QueueResult<u32> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|declared| declared.message_count())
            .map_err(|e| self.topology_error(queue, e))
    }

    async fn queue_purge(&self, queue: &str) -> QueueResult<u32> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.topology_error(queue, e))
    }

    async fn close(&self) -> QueueResult<()> {
        mark_closed(&self.closed_tx, CloseReason::Requested);

        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "closing").await {
                debug!("AMQP channel close: {}", e);
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|e| QueueError::ConnectionLost(e.to_string()))?;
        }
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
            && self.connection.status().connected()
            && self.channel.status().connected()
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::ShortShortUInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::ShortInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::ShortUInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::LongInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::LongUInt(n) => Some(HeaderValue::Int(*n as i64)),
        AMQPValue::LongLongInt(n) => Some(HeaderValue::Int(*n)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Str(s.as_str().to_string())),
        AMQPValue::LongString(s) => Some(HeaderValue::Str(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp.max(0) as u64);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    basic
}

fn message_properties(basic: &BasicProperties) -> MessageProperties {
    let headers = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_value(value).map(|value| (key.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: basic.message_id().as_ref().map(|id| id.as_str().to_string()),
        content_type: basic
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        timestamp: basic.timestamp().as_ref().map(|ts| *ts as i64),
        headers,
    }
}
