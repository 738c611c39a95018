//! Subscriber: an exclusive queue bound to topic patterns, and the loop
//! that hands each delivery to a handler.
//!
//! ## Delivery contract
//!
//! ```text
//! Delivered ──► Processing ──┬── Ok ─────────────────► Acked
//!                            ├── Err / panic / timeout ► Nacked(requeue) ──► Delivered
//!                            └── (DeadLetter policy, count ≥ max) ─────────► DeadLettered
//! ```
//!
//! - prefetch bounds how many deliveries are in flight at once
//! - every delivery runs in its own tracked task; the handler itself runs in
//!   a nested task so a panic is caught and treated as a failure
//! - `cancel` stops taking new deliveries; running handlers finish
//! - when the broker drops the stream, the subscriber reconnects, re-declares
//!   its queue, re-binds and resumes (per [`ReconnectPolicy`](crate::ReconnectPolicy))
//!
//! ## Example
//!
//! ```ignore
//! let subscriber = Subscriber::connect(broker, config).await?;
//! subscriber
//!     .consume(|body: Vec<u8>| async move {
//!         let envelope = Envelope::decode(&body)?;
//!         tracing::info!(event_id = %envelope.event_id, "got event");
//!         Ok::<_, BoxError>(())
//!     })
//!     .await?;
//! ```

mod dispatch;
mod retry;

pub use dispatch::SubscriberStats;
pub use retry::{FailureAction, RetryPolicy};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{Broker, Channel, DeliveryStream};
use crate::config::{ExchangeKind, RoutingConfig, SubscriberOptions};
use crate::error::{BoxError, BusError};
use crate::link::{ChannelOf, ConnectionState, Link};
use dispatch::{Dispatcher, StatsCounters};

/// Queue and patterns currently in effect. Replaced on reconnect.
#[derive(Debug, Clone, Default)]
struct Topology {
    queue: String,
    bound: Vec<String>,
}

/// Declare the exchange and an exclusive queue, then bind every configured
/// pattern. A pattern that fails to bind is logged and left out.
async fn declare_topology<C: Channel>(
    channel: &C,
    config: &RoutingConfig,
    options: &SubscriberOptions,
) -> Result<Topology, BusError> {
    let exchange = config.exchange();
    channel
        .declare_exchange(exchange, config.exchange_kind(), true)
        .await?;

    if let Some(dlx) = options.retry.dead_letter_exchange() {
        if let Err(e) = channel.declare_exchange(dlx, ExchangeKind::Topic, true).await {
            tracing::warn!(exchange = dlx, error = %e, "could not declare dead-letter exchange");
        }
    }

    let queue = channel.declare_exclusive_queue().await.map_err(|e| match e {
        e if e.is_connection_loss() => e,
        e => BusError::DeclareQueue(e.to_string()),
    })?;

    let mut bound = Vec::with_capacity(config.binding_keys().len());
    for pattern in config.binding_keys() {
        match channel.bind_queue(&queue, exchange, pattern).await {
            Ok(()) => {
                tracing::debug!(queue = %queue, exchange, pattern = %pattern, "bound");
                bound.push(pattern.clone());
            }
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    exchange,
                    pattern = %pattern,
                    error = %e,
                    "failed to bind pattern"
                );
            }
        }
    }
    if bound.is_empty() && !config.binding_keys().is_empty() {
        tracing::warn!(
            queue = %queue,
            "no binding patterns could be bound; queue will receive nothing"
        );
    }

    Ok(Topology { queue, bound })
}

/// How a consume session ended.
enum SessionEnd {
    Cancelled,
    StreamClosed,
}

struct ConsumingGuard<'a>(&'a AtomicBool);

impl Drop for ConsumingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Consumes from an exclusive queue bound to the configured patterns.
pub struct Subscriber<B: Broker> {
    config: RoutingConfig,
    options: SubscriberOptions,
    link: Link<B>,
    topology: Mutex<Topology>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<StatsCounters>,
    consuming: AtomicBool,
}

impl<B: Broker> Subscriber<B> {
    /// Connect with default options.
    pub async fn connect(broker: B, config: RoutingConfig) -> Result<Self, BusError> {
        Self::with_options(broker, config, SubscriberOptions::default()).await
    }

    /// Connect, open a channel, declare the exchange and an exclusive
    /// auto-delete queue, and bind the configured patterns.
    ///
    /// Connection, channel, exchange and queue failures are returned. Bind
    /// failures are only logged; see [`bound_patterns`](Self::bound_patterns).
    pub async fn with_options(
        broker: B,
        config: RoutingConfig,
        options: SubscriberOptions,
    ) -> Result<Self, BusError> {
        let link = Link::open(broker, config.uri()).await.inspect_err(|e| {
            tracing::error!(error = %e, "subscriber failed to connect");
        })?;

        let topology = match link.channel().await {
            Ok(channel) => declare_topology(channel.as_ref(), &config, &options).await,
            Err(e) => Err(e),
        };
        let topology = match topology {
            Ok(topology) => topology,
            Err(e) => {
                tracing::error!(
                    exchange = %config.exchange(),
                    error = %e,
                    "subscriber setup failed"
                );
                let _ = link.close().await;
                return Err(e);
            }
        };

        tracing::info!(
            exchange = %config.exchange(),
            queue = %topology.queue,
            subscriber = %config.subscriber_name(),
            patterns = ?topology.bound,
            "subscriber ready"
        );
        Ok(Self {
            config,
            options,
            link,
            topology: Mutex::new(topology),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stats: Arc::new(StatsCounters::default()),
            consuming: AtomicBool::new(false),
        })
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume until cancelled, handing each delivery body to `handler`.
    ///
    /// `Ok` → ack; `Err`, panic or timeout → nack with requeue (or dead
    /// letter, per [`RetryPolicy`]). Returns `Ok(())` once cancelled, or an
    /// error if the stream closed and could not be re-established.
    pub async fn consume<H, Fut, E>(&self, handler: H) -> Result<(), BusError>
    where
        H: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.consume_with_cancellation(move |body, _token| handler(body))
            .await
    }

    /// Like [`consume`](Self::consume), but the handler also receives a
    /// cancellation token. The token fires when the handler times out; it is
    /// a child of the subscriber's token, so it also fires on
    /// [`cancel`](Self::cancel).
    pub async fn consume_with_cancellation<H, Fut, E>(&self, handler: H) -> Result<(), BusError>
    where
        H: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if self.link.is_closed() {
            return Err(BusError::Closed);
        }
        if self.consuming.swap(true, Ordering::AcqRel) {
            return Err(BusError::Consume {
                queue: self.queue_name(),
                reason: "already consuming".into(),
            });
        }
        let _guard = ConsumingGuard(&self.consuming);

        let handler = Arc::new(handler);
        let mut channel = self.link.channel().await?;

        loop {
            let queue = self.queue_name();
            match self.start(channel.as_ref(), &queue).await {
                Ok(stream) => {
                    tracing::info!(queue = %queue, prefetch = self.options.prefetch, "consuming");
                    let dispatcher = Arc::new(
                        Dispatcher::new(
                            Arc::clone(&channel),
                            queue.as_str(),
                            self.options.handler_timeout,
                            self.options.retry.clone(),
                            Arc::clone(&self.stats),
                        )
                        .with_dead_letter_timeout(self.options.dead_letter_timeout),
                    );
                    let end = self.dispatch(stream, dispatcher, &handler).await;
                    if let SessionEnd::Cancelled = end {
                        tracing::info!(queue = %queue, "consumer cancelled");
                        return Ok(());
                    }
                    if self.cancel.is_cancelled() || self.link.is_closed() {
                        return Ok(());
                    }
                    tracing::warn!(queue = %queue, "delivery stream closed by broker");
                }
                Err(e) if e.is_connection_loss() => {
                    tracing::warn!(queue = %queue, error = %e, "could not start consumer");
                }
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "could not start consumer");
                    return Err(e);
                }
            }

            match self.resume().await {
                Ok(Some(fresh)) => channel = fresh,
                Ok(None) => return Ok(()),
                Err(BusError::Reconnect { attempts: 0, .. }) => {
                    return Err(BusError::ConsumerClosed(queue));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn start(&self, channel: &ChannelOf<B>, queue: &str) -> Result<DeliveryStream, BusError> {
        channel
            .set_prefetch(self.options.prefetch)
            .await
            .map_err(|e| match e {
                e if e.is_connection_loss() => e,
                e => BusError::Qos(e.to_string()),
            })?;
        channel.consume(queue, self.config.subscriber_name()).await
    }

    /// Pull deliveries until the stream ends or the subscriber is cancelled.
    async fn dispatch<H, Fut, E>(
        &self,
        mut stream: DeliveryStream,
        dispatcher: Arc<Dispatcher<ChannelOf<B>>>,
        handler: &Arc<H>,
    ) -> SessionEnd
    where
        H: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = stream.next() => {
                    let Some(delivery) = next else {
                        return SessionEnd::StreamClosed;
                    };
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        routing_key = %delivery.routing_key,
                        delivery_tag = delivery.delivery_tag,
                        redelivered = delivery.redelivered,
                        "delivery received"
                    );

                    let dispatcher = Arc::clone(&dispatcher);
                    let handler = Arc::clone(handler);
                    let token = self.cancel.child_token();
                    self.tasks.spawn(async move {
                        dispatcher.run(delivery, handler, token).await;
                    });
                }
            }
        }
    }

    /// Reconnect and replay the topology. `Ok(None)` means the subscriber was
    /// cancelled while waiting.
    async fn resume(&self) -> Result<Option<Arc<ChannelOf<B>>>, BusError> {
        self.link.mark_disconnected();
        let config = &self.config;
        let options = &self.options;
        let topology = &self.topology;

        let reconnected = self
            .link
            .reconnect_with(&options.reconnect, &self.cancel, |channel| async move {
                let fresh = declare_topology(channel.as_ref(), config, options).await?;
                tracing::info!(queue = %fresh.queue, patterns = ?fresh.bound, "topology restored");
                *topology
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
                Ok(())
            })
            .await;

        match reconnected {
            Ok(channel) => Ok(Some(channel)),
            Err(BusError::Closed) if self.cancel.is_cancelled() || self.link.is_closed() => {
                Ok(None)
            }
            Err(e) => {
                tracing::error!(error = %e, "subscriber could not reconnect");
                Err(e)
            }
        }
    }

    /// Stop taking new deliveries. Handlers already running are not
    /// interrupted. Permanent: a cancelled subscriber does not consume again.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Root token; cancelling it is the same as [`cancel`](Self::cancel).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel, wait up to `shutdown_grace` for in-flight handlers to settle,
    /// then close the link.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.cancel.cancel();
        self.tasks.close();

        let grace = self.options.shutdown_grace;
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                in_flight = self.tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "shutdown grace elapsed with handlers still running"
            );
        }
        self.close().await
    }

    /// Cancel and close the link without waiting. Safe to call more than once.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.link.is_closed() {
            return Ok(());
        }
        self.cancel.cancel();
        let result = self.link.close().await;
        tracing::info!(queue = %self.queue_name(), "subscriber closed");
        result
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats.snapshot()
    }

    /// Server-assigned name of the current queue.
    pub fn queue_name(&self) -> String {
        self.topology().queue.clone()
    }

    /// Patterns that bound successfully, in configuration order.
    pub fn bound_patterns(&self) -> Vec<String> {
        self.topology().bound.clone()
    }

    /// Deliveries currently being handled.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }
}
