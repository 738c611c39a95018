//! Topic-routed event bus for services that talk through a message broker.
//!
//! A [`Publisher`] wraps domain events in an [`Envelope`] and publishes them
//! to a topic exchange under a routing key. A [`Subscriber`] binds an
//! exclusive queue to routing patterns (`product.*`) and hands each delivery
//! to a handler: success acks, failure requeues.
//!
//! ```text
//! ┌──────────────┐  send_message(event, "product.create_product")
//! │  Publisher   │──────────────────────────────┐
//! └──────────────┘                              ▼
//!                                   ┌──────────────────────┐
//!                                   │  exchange (topic)    │
//!                                   └──────────────────────┘
//!                                     │ product.*    │ customer.*
//!                                     ▼              ▼
//!                               ┌──────────┐   ┌──────────┐
//!                               │ queue A  │   │ queue B  │   (exclusive, auto-delete)
//!                               └──────────┘   └──────────┘
//!                                     │              │
//!                               Subscriber A   Subscriber B ── handler(body) → ack / nack
//! ```
//!
//! Brokers plug in through the [`broker`] traits. [`InMemoryBroker`] is
//! always available; an AMQP 0-9-1 transport is behind the `amqp` feature.

extern crate self as topic_bus;

pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod link;
pub mod publisher;
pub mod subscriber;
pub mod topic;
pub mod topics;

pub use broker::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;
pub use config::{ConfigError, ExchangeKind, PublisherOptions, RoutingConfig, SubscriberOptions};
pub use envelope::{DecodeError, Envelope};
pub use error::{BoxError, BusError};
pub use event::BusEvent;
pub use handler::{envelope_handler, event_handler, ConsumeError, DecodePolicy, HandlerError};
pub use link::{ConnectionState, ReconnectPolicy};
pub use publisher::Publisher;
pub use subscriber::{RetryPolicy, Subscriber, SubscriberStats};
pub use topic::{BindingPattern, RoutingKey, TopicError};

// Derive macro, same name as the trait (like serde's Serialize).
pub use topic_bus_macros::BusEvent;
