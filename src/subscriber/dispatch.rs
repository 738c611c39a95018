//! Per-delivery dispatch: run the handler, then settle with the broker.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::retry::{FailureAction, RetryPolicy};
use crate::broker::{Channel, Delivery, OutboundMessage};
use crate::config::DEFAULT_PUBLISH_TIMEOUT;
use crate::error::{BoxError, BusError};

/// Snapshot of subscriber counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Deliveries taken off the stream.
    pub received: usize,
    pub acked: usize,
    /// Nacked with requeue.
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Handler returned an error.
    pub failed: usize,
    pub timed_out: usize,
    pub panicked: usize,
    /// Ack, nack or dead-letter publish rejected by the broker.
    pub settle_failures: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) received: AtomicUsize,
    acked: AtomicUsize,
    requeued: AtomicUsize,
    dead_lettered: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    panicked: AtomicUsize,
    settle_failures: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

/// How one handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
    Panicked(String),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs handlers for one consume session and settles their deliveries.
pub(crate) struct Dispatcher<C> {
    channel: Arc<C>,
    queue: String,
    handler_timeout: Duration,
    dead_letter_timeout: Duration,
    retry: RetryPolicy,
    stats: Arc<StatsCounters>,
}

impl<C: Channel> Dispatcher<C> {
    pub(crate) fn new(
        channel: Arc<C>,
        queue: impl Into<String>,
        handler_timeout: Duration,
        retry: RetryPolicy,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
            handler_timeout,
            dead_letter_timeout: DEFAULT_PUBLISH_TIMEOUT,
            retry,
            stats,
        }
    }

    /// Deadline for the dead-letter publish; expiry counts as a failed
    /// publish and the delivery is requeued.
    pub(crate) fn with_dead_letter_timeout(mut self, timeout: Duration) -> Self {
        self.dead_letter_timeout = timeout;
        self
    }

    /// Run `handler` on the delivery body in its own task, under the handler
    /// timeout, then ack or nack.
    ///
    /// On timeout the handler task is left running; `token` is cancelled so
    /// a cooperative handler can stop early.
    pub(crate) async fn run<H, Fut, E>(
        &self,
        delivery: Delivery,
        handler: Arc<H>,
        token: CancellationToken,
    ) where
        H: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let body = delivery.body.clone();
        let handler_token = token.clone();
        let mut task = tokio::spawn(async move { handler(body, handler_token).await });

        let outcome = match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Outcome::Completed,
            Ok(Ok(Err(e))) => Outcome::Failed(Into::<BoxError>::into(e).to_string()),
            Ok(Err(join)) if join.is_panic() => Outcome::Panicked(panic_message(join.into_panic())),
            Ok(Err(join)) => Outcome::Failed(join.to_string()),
            Err(_) => {
                token.cancel();
                Outcome::TimedOut
            }
        };

        self.settle(&delivery, outcome).await;
    }

    pub(crate) async fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        let queue = self.queue.as_str();
        let routing_key = delivery.routing_key.as_str();
        let delivery_tag = delivery.delivery_tag;

        match &outcome {
            Outcome::Completed => {
                match delivery.ack().await {
                    Ok(()) => bump(&self.stats.acked),
                    Err(e) => {
                        bump(&self.stats.settle_failures);
                        tracing::error!(queue, routing_key, delivery_tag, error = %e, "ack failed");
                    }
                }
                return;
            }
            Outcome::Failed(reason) => {
                bump(&self.stats.failed);
                tracing::warn!(
                    queue,
                    routing_key,
                    delivery_tag,
                    redelivered = delivery.redelivered,
                    error = %reason,
                    "handler failed"
                );
            }
            Outcome::TimedOut => {
                bump(&self.stats.timed_out);
                tracing::warn!(
                    queue,
                    routing_key,
                    delivery_tag,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "handler timed out"
                );
            }
            Outcome::Panicked(message) => {
                bump(&self.stats.panicked);
                tracing::error!(
                    queue,
                    routing_key,
                    delivery_tag,
                    panic = %message,
                    "handler panicked"
                );
            }
        }

        if let FailureAction::DeadLetter {
            exchange,
            routing_key: dead_key,
        } = self.retry.on_failure(delivery.delivery_count)
        {
            if self.dead_letter(delivery, exchange, dead_key).await {
                return;
            }
        }

        match delivery.nack(true).await {
            Ok(()) => bump(&self.stats.requeued),
            Err(e) => {
                bump(&self.stats.settle_failures);
                tracing::error!(queue, routing_key, delivery_tag, error = %e, "nack failed");
            }
        }
    }

    /// Publish the raw body to the dead-letter target and ack. Returns
    /// `false` if the message should be requeued instead.
    async fn dead_letter(&self, delivery: &Delivery, exchange: &str, routing_key: &str) -> bool {
        let mut message = OutboundMessage::new(delivery.body.clone());
        if let Some(id) = &delivery.message_id {
            message = message.with_message_id(id.as_str());
        }

        let publish = self.channel.publish(exchange, routing_key, message);
        let published = match tokio::time::timeout(self.dead_letter_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(BusError::PublishTimeout {
                routing_key: routing_key.to_string(),
                timeout: self.dead_letter_timeout,
            }),
        };
        if let Err(e) = published {
            bump(&self.stats.settle_failures);
            tracing::error!(
                queue = %self.queue,
                exchange,
                routing_key,
                error = %e,
                "dead-letter publish failed, requeueing"
            );
            return false;
        }

        match delivery.ack().await {
            Ok(()) => {
                bump(&self.stats.dead_lettered);
                tracing::warn!(
                    queue = %self.queue,
                    source_key = %delivery.routing_key,
                    deliveries = delivery.delivery_count.unwrap_or_default(),
                    exchange,
                    routing_key,
                    "message dead-lettered"
                );
            }
            Err(e) => {
                bump(&self.stats.settle_failures);
                tracing::error!(queue = %self.queue, error = %e, "ack after dead-letter failed");
            }
        }
        true
    }
}
