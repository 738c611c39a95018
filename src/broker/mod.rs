//! Broker seam: the operations the bus needs from a message broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Publisher / Subscriber (per service)           │
//! │  send_message() / consume(handler)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Broker → Connection → Channel             │
//! │  declare_exchange / declare_exclusive_queue / bind_queue    │
//! │  set_prefetch / publish / consume  ──►  Delivery + Acker    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────────┐          ┌──────────────────────────┐
//! │   InMemoryBroker     │          │   AmqpBroker             │
//! │   (included)         │          │   (feature = "amqp")     │
//! └──────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Topic matching is the broker's job; the bus only supplies patterns at
//! bind time and routing keys at publish time.

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ExchangeKind;
use crate::error::BusError;

pub use memory::InMemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

/// Stream of deliveries for one consumer. Ends when the broker closes it.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Entry point of a transport: dials connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection.
    async fn connect(&self, uri: &str) -> Result<Self::Connection, BusError>;
}

/// One broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel, BusError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), BusError>;

    fn is_open(&self) -> bool;
}

/// One channel. Operations on a channel are ordered by the broker.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare a durable (or transient) exchange. Redeclaring with the same
    /// kind is a no-op.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BusError>;

    /// Declare an exclusive, auto-delete, server-named queue and return its
    /// name.
    async fn declare_exclusive_queue(&self) -> Result<String, BusError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BusError>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BusError>;

    /// Publish, non-mandatory and non-immediate. Returns once the broker has
    /// accepted the frame; no publisher confirmation is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BusError>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<(), BusError>;

    fn is_open(&self) -> bool;
}

/// Settles deliveries with the broker.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError>;
}

/// Message body and properties handed to [`Channel::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// One message in flight to one consumer.
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    /// Set by the broker when this message was delivered before.
    pub redelivered: bool,
    /// Broker-reported delivery count (`x-delivery-count`), when available.
    pub delivery_count: Option<u32>,
    pub message_id: Option<String>,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            body,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered: false,
            delivery_count: None,
            message_id: None,
            acker,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_delivery_count(mut self, count: Option<u32>) -> Self {
        self.delivery_count = count;
        self
    }

    pub fn with_message_id(mut self, id: Option<String>) -> Self {
        self.message_id = id;
        self
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("body_len", &self.body.len())
            .finish()
    }
}
