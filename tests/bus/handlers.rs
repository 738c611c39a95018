//! Undecodable bodies and the typed handler adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use topic_bus::broker::memory::SettleOutcome;
use topic_bus::{
    envelope_handler, event_handler, BoxError, ConsumeError, DecodePolicy, InMemoryBroker,
};

use crate::support::{
    eventually, options, publisher, spawn_consume, subscriber, ProductCreated, EXCHANGE,
};

const GARBAGE: &[u8] = b"\xff\xfe not protobuf";

#[tokio::test]
async fn raw_handler_sees_malformed_bytes_unchanged() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(&broker, &["product.*"], options()).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let consumer = spawn_consume(&subscriber, move |body: Vec<u8>| {
        sink.lock().unwrap().push(body);
        async { Ok::<_, BoxError>(()) }
    });

    broker
        .inject(EXCHANGE, "product.create_product", GARBAGE)
        .unwrap();

    eventually("ack", || broker.stats().acked == 1).await;
    assert_eq!(*received.lock().unwrap(), [GARBAGE.to_vec()]);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn drop_policy_acks_malformed_without_calling_consumer() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(&broker, &["product.*"], options()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&calls);
    let consumer = spawn_consume(
        &subscriber,
        envelope_handler(DecodePolicy::Drop, move |_envelope| {
            count.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }),
    );

    broker
        .inject(EXCHANGE, "product.create_product", GARBAGE)
        .unwrap();

    eventually("ack", || broker.stats().acked == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.stats().requeued, 0);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn requeue_policy_redelivers_malformed() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(&broker, &["product.*"], options()).await;

    let consumer = spawn_consume(
        &subscriber,
        envelope_handler(DecodePolicy::Requeue, |_envelope| async { Ok(()) }),
    );

    broker
        .inject(EXCHANGE, "product.create_product", GARBAGE)
        .unwrap();

    eventually("redelivery", || broker.stats().requeued >= 2).await;
    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());

    assert_eq!(broker.stats().acked, 0);
    assert_eq!(broker.settlements()[0].outcome, SettleOutcome::Requeued);
}

#[tokio::test]
async fn typed_handler_acks_permanent_failures() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["product.*"], options()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = spawn_consume(
        &subscriber,
        event_handler(DecodePolicy::Drop, move |event: ProductCreated, envelope| {
            let sink = Arc::clone(&sink);
            async move {
                assert_eq!(envelope.payload_type(), Some("ProductCreated"));
                sink.lock().unwrap().push(event.product_id.clone());
                if event.price == 0 {
                    return Err(ConsumeError::permanent("price must be positive"));
                }
                Ok(())
            }
        }),
    );

    publisher
        .publish(&ProductCreated {
            product_id: "free".into(),
            price: 0,
        })
        .await
        .unwrap();
    publisher
        .publish(&ProductCreated {
            product_id: "p1".into(),
            price: 10,
        })
        .await
        .unwrap();

    eventually("both acked", || broker.stats().acked == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, ["free", "p1"]);
    assert_eq!(broker.stats().requeued, 0);

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}
