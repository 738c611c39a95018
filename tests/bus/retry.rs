//! Redelivery and dead-lettering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use topic_bus::broker::memory::SettleOutcome;
use topic_bus::{BoxError, Envelope, InMemoryBroker, RetryPolicy};

use crate::support::{eventually, options, publisher, spawn_consume, subscriber};

#[tokio::test]
async fn transient_failure_is_redelivered_then_acked() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&deliveries);
    let consumer = spawn_consume(&subscriber, move |_body: Vec<u8>| {
        let attempt = count.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt == 1 {
                return Err("database connection reset".into());
            }
            Ok::<_, BoxError>(())
        }
    });

    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();

    eventually("ack", || broker.stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 2);
    assert_eq!(settlements[0].outcome, SettleOutcome::Requeued);
    assert_eq!(settlements[1].outcome, SettleOutcome::Acked);
    assert_eq!(settlements[0].seq, settlements[1].seq);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn dead_lettered_after_max_deliveries() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(
        &broker,
        &["order.*"],
        options().with_retry(RetryPolicy::dead_letter(3, "shop.dlx", "order.dead")),
    )
    .await;
    assert!(broker.exchange_kind("shop.dlx").is_some());

    let attempts = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&attempts);
    let consumer = spawn_consume(&subscriber, move |_body: Vec<u8>| {
        count.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>("order references unknown product") }
    });

    let event_id = publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();

    eventually("dead letter", || subscriber.stats().dead_lettered == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let outcomes: Vec<_> = broker.settlements().iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        [
            SettleOutcome::Requeued,
            SettleOutcome::Requeued,
            SettleOutcome::Acked
        ]
    );

    let dead = broker.published_to("order.dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].exchange, "shop.dlx");
    assert_eq!(Envelope::decode(&dead[0].body).unwrap().event_id, event_id);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn dead_letter_publish_failure_requeues() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(
        &broker,
        &["order.*"],
        options().with_retry(RetryPolicy::dead_letter(1, "shop.dlx", "order.dead")),
    )
    .await;

    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();
    broker.reject_publishes(true);
    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        Err::<(), _>("always fails")
    });

    eventually("requeues", || subscriber.stats().requeued >= 2).await;
    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());

    assert_eq!(subscriber.stats().dead_lettered, 0);
    assert_eq!(broker.stats().acked, 0);
    assert!(broker.published_to("order.dead").is_empty());
}
