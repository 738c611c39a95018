//! Ack/nack contract: success, error, timeout, panic, backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use topic_bus::broker::memory::SettleOutcome;
use topic_bus::{BoxError, InMemoryBroker};

use crate::support::{eventually, options, publisher, spawn_consume, subscriber};

#[tokio::test]
async fn success_is_acked_exactly_once() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        Ok::<_, BoxError>(())
    });
    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();

    eventually("ack", || broker.stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].outcome, SettleOutcome::Acked);
    assert_eq!(broker.stats().requeued, 0);

    let stats = subscriber.stats();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn error_is_requeued_never_acked() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        Err::<(), _>("inventory service unavailable")
    });
    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();

    eventually("three requeues", || broker.stats().requeued >= 3).await;
    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());

    assert_eq!(broker.stats().acked, 0);
    assert!(broker
        .settlements()
        .iter()
        .all(|s| s.outcome == SettleOutcome::Requeued));
    assert!(subscriber.stats().failed >= 3);
}

#[tokio::test]
async fn timeout_is_requeued_and_redelivered() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(
        &broker,
        &["order.*"],
        options().with_handler_timeout(Duration::from_millis(50)),
    )
    .await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let consumer = spawn_consume(&subscriber, move |_body: Vec<u8>| {
        let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok::<_, BoxError>(())
        }
    });
    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();

    eventually("ack after timeout", || broker.stats().acked == 1).await;

    let outcomes: Vec<_> = broker.settlements().iter().map(|s| s.outcome).collect();
    assert_eq!(outcomes, [SettleOutcome::Requeued, SettleOutcome::Acked]);
    assert_eq!(broker.settlements()[1].delivery_count, 2);
    assert_eq!(subscriber.stats().timed_out, 1);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn panic_is_isolated() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let panicked = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&panicked);
    let consumer = spawn_consume(&subscriber, move |body: Vec<u8>| {
        let poisoned = topic_bus::Envelope::decode(&body)
            .ok()
            .and_then(|env| env.decode_payload::<String>().ok())
            .is_some_and(|payload| payload == "poison");
        let first = poisoned && count.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                panic!("handler blew up");
            }
            Ok::<_, BoxError>(())
        }
    });

    publisher
        .send_message(&"poison".to_string(), "order.create_order")
        .await
        .unwrap();
    publisher
        .send_message(&"fine".to_string(), "order.create_order")
        .await
        .unwrap();

    eventually("both acked", || broker.stats().acked == 2).await;

    let stats = subscriber.stats();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.requeued, 1);
    assert!(!consumer.is_finished());

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn prefetch_bounds_outstanding_deliveries() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;
    let queue = subscriber.queue_name();

    for i in 0..50 {
        publisher
            .send_message(&i, "order.create_order")
            .await
            .unwrap();
    }

    let gate = Arc::new(Semaphore::new(0));
    let permits = Arc::clone(&gate);
    let consumer = spawn_consume(&subscriber, move |_body: Vec<u8>| {
        let permits = Arc::clone(&permits);
        async move {
            permits.acquire().await?.forget();
            Ok::<_, BoxError>(())
        }
    });

    eventually("ten in flight", || subscriber.stats().received == 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(subscriber.stats().received, 10);
    assert_eq!(broker.unacked_count(&queue), 10);
    assert_eq!(broker.ready_count(&queue), 40);

    gate.add_permits(50);
    eventually("all acked", || broker.stats().acked == 50).await;
    assert!(broker.max_unacked(&queue) <= 10);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}
