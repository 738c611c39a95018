//! Error types for the event bus.
//!
//! Errors are grouped by when they can happen:
//!
//! - **Setup**: connection, channel, exchange and queue declaration while a
//!   [`Publisher`](crate::Publisher) or [`Subscriber`](crate::Subscriber) is
//!   being constructed. Returned to the caller, never retried.
//! - **Binding**: a single pattern failed to bind. Logged by the subscriber,
//!   never returned from a constructor.
//! - **Publish**: routing-key, serialization or publish failures, returned synchronously
//!   from `send_message`.
//! - **Consume**: QoS, consumer registration, stream closure, settlement.

use std::time::Duration;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker refused or dropped the connection attempt.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// A channel could not be opened on the connection.
    #[error("failed to open channel: {0}")]
    Channel(String),

    /// Exchange declaration failed (including a kind mismatch on redeclare).
    #[error("failed to declare exchange `{exchange}`: {reason}")]
    DeclareExchange { exchange: String, reason: String },

    /// Queue declaration failed.
    #[error("failed to declare queue: {0}")]
    DeclareQueue(String),

    /// A binding pattern could not be bound to the queue.
    #[error("failed to bind `{pattern}` on exchange `{exchange}`: {reason}")]
    Bind {
        exchange: String,
        pattern: String,
        reason: String,
    },

    /// The publish topic is not a valid routing key (empty, empty segment,
    /// or a wildcard).
    #[error("invalid routing key: {0}")]
    RoutingKey(#[from] crate::topic::TopicError),

    /// The domain event could not be serialized into a payload.
    #[error("failed to serialize event payload: {0}")]
    Serialize(String),

    /// The broker rejected the publish call.
    #[error("failed to publish to `{routing_key}`: {reason}")]
    Publish { routing_key: String, reason: String },

    /// The publish call did not complete within the deadline.
    #[error("publish to `{routing_key}` timed out after {timeout:?}")]
    PublishTimeout {
        routing_key: String,
        timeout: Duration,
    },

    /// Publishing to an exchange the broker does not know.
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Setting the prefetch count failed.
    #[error("failed to set QoS: {0}")]
    Qos(String),

    /// Registering the consumer failed.
    #[error("failed to start consuming from `{queue}`: {reason}")]
    Consume { queue: String, reason: String },

    /// The broker closed the delivery stream.
    #[error("delivery stream for `{0}` closed by broker")]
    ConsumerClosed(String),

    /// Ack or nack was rejected by the broker.
    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },

    /// The connection or channel is no longer open.
    #[error("channel closed")]
    ChannelClosed,

    /// Reconnection gave up.
    #[error("reconnect failed after {attempts} attempt(s): {last_error}")]
    Reconnect { attempts: u32, last_error: String },

    /// The publisher or subscriber was closed by its owner.
    #[error("already closed")]
    Closed,
}

impl BusError {
    /// Whether this error means the link to the broker is gone, as opposed to
    /// a rejection of one particular operation.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BusError::ChannelClosed | BusError::Connect(_) | BusError::ConsumerClosed(_)
        )
    }
}

impl From<bitcode::Error> for BusError {
    fn from(err: bitcode::Error) -> Self {
        BusError::Serialize(err.to_string())
    }
}
