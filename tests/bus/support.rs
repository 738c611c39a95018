//! Shared fixtures: domain events, configs and polling helpers.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use topic_bus::{
    BoxError, BusError, BusEvent, InMemoryBroker, Publisher, ReconnectPolicy, RoutingConfig,
    Subscriber, SubscriberOptions,
};

pub const EXCHANGE: &str = "shop";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, BusEvent)]
#[bus_event(topic = "product.create_product")]
pub struct ProductCreated {
    pub product_id: String,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, BusEvent)]
#[bus_event(topic = "customer.create_customer", name = "customer.created")]
pub struct CustomerCreated {
    pub customer_id: String,
}

/// Install a log subscriber once; `RUST_LOG=topic_bus=debug` to see output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(patterns: &[&str]) -> RoutingConfig {
    RoutingConfig::new("memory://", EXCHANGE)
        .with_publisher_name("catalog-service")
        .with_subscriber_name("test-consumer")
        .bind_all(patterns.iter().copied())
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_initial_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_max_attempts(20)
}

pub fn options() -> SubscriberOptions {
    SubscriberOptions::default()
        .with_handler_timeout(Duration::from_secs(2))
        .with_reconnect(fast_reconnect())
        .with_shutdown_grace(Duration::from_secs(2))
}

pub async fn publisher(broker: &InMemoryBroker) -> Publisher<InMemoryBroker> {
    init_tracing();
    Publisher::connect(broker.clone(), config(&[]))
        .await
        .expect("publisher connects")
}

pub async fn subscriber(
    broker: &InMemoryBroker,
    patterns: &[&str],
    options: SubscriberOptions,
) -> Arc<Subscriber<InMemoryBroker>> {
    init_tracing();
    Arc::new(
        Subscriber::with_options(broker.clone(), config(patterns), options)
            .await
            .expect("subscriber connects"),
    )
}

/// Run `consume` in the background.
pub fn spawn_consume<H, Fut, E>(
    subscriber: &Arc<Subscriber<InMemoryBroker>>,
    handler: H,
) -> JoinHandle<Result<(), BusError>>
where
    H: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let subscriber = Arc::clone(subscriber);
    tokio::spawn(async move { subscriber.consume(handler).await })
}

/// Run `consume_with_cancellation` in the background.
pub fn spawn_consume_with_token<H, Fut, E>(
    subscriber: &Arc<Subscriber<InMemoryBroker>>,
    handler: H,
) -> JoinHandle<Result<(), BusError>>
where
    H: Fn(Vec<u8>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let subscriber = Arc::clone(subscriber);
    tokio::spawn(async move { subscriber.consume_with_cancellation(handler).await })
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
