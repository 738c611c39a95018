//! AMQP 0-9-1 transport over [`lapin`].
//!
//! Maps the broker seam one to one onto AMQP methods:
//!
//! | seam                        | AMQP                                                  |
//! |-----------------------------|-------------------------------------------------------|
//! | `declare_exchange`          | `exchange.declare` (durable flag as given)            |
//! | `declare_exclusive_queue`   | `queue.declare ""` exclusive, auto-delete, transient  |
//! | `bind_queue`                | `queue.bind`                                          |
//! | `set_prefetch`              | `basic.qos`                                           |
//! | `publish`                   | `basic.publish`, non-mandatory, confirm not awaited   |
//! | `consume`                   | `basic.consume`, manual ack                           |
//!
//! Delivery counts come from the `x-delivery-count` header (set by quorum
//! queues); classic queues do not report one.

use std::fmt;

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};

use super::{Acker, Broker, Channel, Connection, Delivery, DeliveryStream, OutboundMessage};
use crate::config::ExchangeKind;
use crate::error::BusError;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const REPLY_SUCCESS: u16 = 200;

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// Errors that mean the channel or connection is gone.
fn is_closed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    )
}

fn delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let previous = match headers.inner().get(&ShortString::from(DELIVERY_COUNT_HEADER))? {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }?;
    // The header counts previous deliveries; ours includes this one.
    Some(previous.saturating_add(1))
}

/// Dials AMQP brokers.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (executor, reactor, client name).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self, uri: &str) -> Result<AmqpConnection, BusError> {
        let inner = lapin::Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(AmqpConnection { inner })
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel, BusError> {
        let inner = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;
        Ok(AmqpChannel { inner })
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        match self.inner.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => Ok(()),
            Err(e) if is_closed(&e) => Ok(()),
            Err(e) => Err(BusError::Connect(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    fn lost_or(&self, err: lapin::Error, other: impl FnOnce(String) -> BusError) -> BusError {
        if is_closed(&err) || !self.inner.status().connected() {
            BusError::ChannelClosed
        } else {
            other(err.to_string())
        }
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BusError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        self.inner
            .exchange_declare(name, lapin_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| {
                self.lost_or(e, |reason| BusError::DeclareExchange {
                    exchange: name.to_string(),
                    reason,
                })
            })
    }

    async fn declare_exclusive_queue(&self) -> Result<String, BusError> {
        let options = QueueDeclareOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        };
        let queue = self
            .inner
            .queue_declare("", options, FieldTable::default())
            .await
            .map_err(|e| self.lost_or(e, BusError::DeclareQueue))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                self.lost_or(e, |reason| BusError::Bind {
                    exchange: exchange.to_string(),
                    pattern: pattern.to_string(),
                    reason,
                })
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BusError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.lost_or(e, BusError::Qos))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BusError> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if let Some(id) = message.message_id {
            properties = properties.with_message_id(ShortString::from(id));
        }
        if let Some(app_id) = message.app_id {
            properties = properties.with_app_id(ShortString::from(app_id));
        }

        // Publisher confirms are not enabled; the confirmation is ignored.
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| {
                self.lost_or(e, |reason| BusError::Publish {
                    routing_key: routing_key.to_string(),
                    reason,
                })
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                self.lost_or(e, |reason| BusError::Consume {
                    queue: queue.to_string(),
                    reason,
                })
            })?;

        let queue = queue.to_string();
        let stream = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    tracing::warn!(queue = %queue, error = %e, "amqp consumer ended");
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok().map(into_delivery)));
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        match self.inner.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => Ok(()),
            Err(e) if is_closed(&e) => Ok(()),
            Err(e) => Err(BusError::Channel(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let count = delivery_count(&delivery.properties);
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    Delivery::new(
        delivery.data,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.delivery_tag,
        std::sync::Arc::new(AmqpAcker(delivery.acker)),
    )
    .with_redelivered(delivery.redelivered)
    .with_delivery_count(count)
    .with_message_id(message_id)
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| settle_error(delivery_tag, e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        let options = BasicNackOptions {
            requeue,
            ..Default::default()
        };
        self.0
            .nack(options)
            .await
            .map_err(|e| settle_error(delivery_tag, e))
    }
}

fn settle_error(delivery_tag: u64, err: lapin::Error) -> BusError {
    if is_closed(&err) {
        BusError::ChannelClosed
    } else {
        BusError::Settle {
            delivery_tag,
            reason: err.to_string(),
        }
    }
}
