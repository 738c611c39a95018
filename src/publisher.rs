//! Publisher: wraps domain events in envelopes and publishes them.
//!
//! ```text
//! send_message(event, topic)
//!   │  bitcode::serialize(event)
//!   ▼
//! Envelope { event_type: topic, event_id, timestamp, version: 1, payload, metadata }
//!   │  prost encode
//!   ▼
//! channel.publish(exchange, routing_key = topic)   (bounded by publish_timeout)
//! ```
//!
//! A publisher owns one connection and one channel. Publishing through `&self`
//! from several tasks is fine; the channel orders the frames.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Channel, OutboundMessage};
use crate::config::{PublisherOptions, RoutingConfig};
use crate::envelope::{Envelope, METADATA_PAYLOAD_TYPE, METADATA_PUBLISHER};
use crate::error::BusError;
use crate::event::BusEvent;
use crate::link::{ChannelOf, ConnectionState, Link};
use crate::topic::RoutingKey;

/// Content type set on every published message.
pub const CONTENT_TYPE: &str = "application/x-protobuf";

async fn declare_exchange<C: Channel>(channel: &C, config: &RoutingConfig) -> Result<(), BusError> {
    channel
        .declare_exchange(config.exchange(), config.exchange_kind(), true)
        .await
}

/// Publishes envelopes to the configured exchange.
pub struct Publisher<B: Broker> {
    config: RoutingConfig,
    options: PublisherOptions,
    link: Link<B>,
    shutdown: CancellationToken,
}

impl<B: Broker> Publisher<B> {
    /// Connect with default options.
    pub async fn connect(broker: B, config: RoutingConfig) -> Result<Self, BusError> {
        Self::with_options(broker, config, PublisherOptions::default()).await
    }

    /// Connect, open a channel and declare the exchange (durable). Any
    /// failure is returned as is; nothing is retried at startup.
    pub async fn with_options(
        broker: B,
        config: RoutingConfig,
        options: PublisherOptions,
    ) -> Result<Self, BusError> {
        let link = Link::open(broker, config.uri()).await.inspect_err(|e| {
            tracing::error!(error = %e, "publisher failed to connect");
        })?;

        let declared = match link.channel().await {
            Ok(channel) => declare_exchange(channel.as_ref(), &config).await,
            Err(e) => Err(e),
        };
        if let Err(e) = declared {
            tracing::error!(exchange = %config.exchange(), error = %e, "publisher setup failed");
            let _ = link.close().await;
            return Err(e);
        }

        tracing::info!(
            exchange = %config.exchange(),
            kind = %config.exchange_kind(),
            publisher = %config.publisher_name(),
            "publisher ready"
        );
        Ok(Self {
            config,
            options,
            link,
            shutdown: CancellationToken::new(),
        })
    }

    /// Serialize `event`, wrap it and publish it under `topic`.
    ///
    /// `payload_type` metadata is the Rust type name of `T`. Returns the
    /// envelope's `event_id`.
    pub async fn send_message<T: Serialize>(
        &self,
        event: &T,
        topic: &str,
    ) -> Result<String, BusError> {
        self.send_typed(event, topic, std::any::type_name::<T>())
            .await
    }

    /// Publish a [`BusEvent`] under its own topic.
    pub async fn publish<E: BusEvent>(&self, event: &E) -> Result<String, BusError> {
        self.send_typed(event, E::TOPIC, E::NAME).await
    }

    async fn send_typed<T: Serialize>(
        &self,
        event: &T,
        topic: &str,
        payload_type: &str,
    ) -> Result<String, BusError> {
        let topic = RoutingKey::parse(topic)
            .inspect_err(|e| tracing::error!(error = %e, "refusing to publish"))?;
        let envelope = Envelope::wrap(topic.as_str(), event)
            .inspect_err(|e| {
                tracing::error!(topic = %topic, error = %e, "failed to serialize event")
            })?
            .with_metadata(METADATA_PUBLISHER, self.config.publisher_name())
            .with_metadata(METADATA_PAYLOAD_TYPE, payload_type);

        self.publish_envelope(&envelope).await?;
        Ok(envelope.event_id)
    }

    /// Publish a prebuilt envelope under its `event_type`, which must be a
    /// valid routing key.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), BusError> {
        let key = RoutingKey::parse(envelope.event_type.as_str())?;
        let routing_key = key.as_str();
        let channel = self.ready_channel().await?;

        let mut message = OutboundMessage::new(envelope.encode())
            .with_content_type(CONTENT_TYPE)
            .with_message_id(envelope.event_id.as_str());
        if !self.config.publisher_name().is_empty() {
            message = message.with_app_id(self.config.publisher_name());
        }

        let timeout = self.options.publish_timeout;
        let publish = channel.publish(self.config.exchange(), routing_key, message);
        match tokio::time::timeout(timeout, publish).await {
            Ok(Ok(())) => {
                tracing::debug!(
                    exchange = %self.config.exchange(),
                    routing_key,
                    event_id = %envelope.event_id,
                    "published"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                if e.is_connection_loss() {
                    self.link.mark_disconnected();
                }
                tracing::error!(routing_key, error = %e, "publish failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    routing_key,
                    timeout_ms = timeout.as_millis() as u64,
                    "publish timed out"
                );
                Err(BusError::PublishTimeout {
                    routing_key: routing_key.to_string(),
                    timeout,
                })
            }
        }
    }

    /// The channel to publish on, re-establishing the link first if it was
    /// found disconnected.
    async fn ready_channel(&self) -> Result<std::sync::Arc<ChannelOf<B>>, BusError> {
        if self.link.is_closed() {
            return Err(BusError::Closed);
        }
        if self.link.state() == ConnectionState::Connected && self.link.is_open().await {
            return self.link.channel().await;
        }

        self.link.mark_disconnected();
        let config = &self.config;
        self.link
            .reconnect_with(&self.options.reconnect, &self.shutdown, |channel| async move {
                declare_exchange(channel.as_ref(), config).await
            })
            .await
    }

    /// Close the channel and connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.link.is_closed() {
            return Ok(());
        }
        self.shutdown.cancel();
        let result = self.link.close().await;
        tracing::info!(exchange = %self.config.exchange(), "publisher closed");
        result
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }
}
