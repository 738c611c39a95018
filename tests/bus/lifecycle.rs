//! Reconnect, cancellation, shutdown and close.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use topic_bus::{
    BoxError, BusError, ConnectionState, Envelope, InMemoryBroker, Publisher, PublisherOptions,
    ReconnectPolicy,
};

use crate::support::{
    config, eventually, fast_reconnect, options, publisher, spawn_consume,
    spawn_consume_with_token, subscriber,
};

async fn reconnecting_publisher(broker: &InMemoryBroker) -> Publisher<InMemoryBroker> {
    Publisher::with_options(
        broker.clone(),
        config(&[]),
        PublisherOptions::default().with_reconnect(fast_reconnect()),
    )
    .await
    .expect("publisher connects")
}

#[tokio::test]
async fn consumer_resumes_after_connection_loss() {
    let broker = InMemoryBroker::new();
    let publisher = reconnecting_publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;
    let first_queue = subscriber.queue_name();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = spawn_consume(&subscriber, move |body: Vec<u8>| {
        let result = Envelope::decode(&body)
            .and_then(|env| env.decode_payload::<String>())
            .map(|order| sink.lock().unwrap().push(order))
            .map_err(BoxError::from);
        std::future::ready(result)
    });

    publisher
        .send_message(&"before".to_string(), "order.create_order")
        .await
        .unwrap();
    eventually("first ack", || broker.stats().acked == 1).await;

    broker.drop_connections();
    eventually("topology restored", || {
        subscriber.state() == ConnectionState::Connected && subscriber.queue_name() != first_queue
    })
    .await;

    let second_queue = subscriber.queue_name();
    assert!(!broker.queue_names().contains(&first_queue));
    assert_eq!(broker.bindings(&second_queue), ["order.*"]);
    eventually("consumer re-attached", || broker.has_consumer(&second_queue)).await;

    publisher
        .send_message(&"after".to_string(), "order.create_order")
        .await
        .unwrap();
    eventually("second ack", || broker.stats().acked == 2).await;

    assert_eq!(*seen.lock().unwrap(), ["before", "after"]);
    assert!(!consumer.is_finished());

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn disabled_reconnect_ends_consume_with_error() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(
        &broker,
        &["order.*"],
        options().with_reconnect(ReconnectPolicy::disabled()),
    )
    .await;
    let queue = subscriber.queue_name();

    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        Ok::<_, BoxError>(())
    });
    eventually("consuming", || broker.has_consumer(&queue)).await;

    broker.drop_connections();

    let result = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .expect("consume returns")
        .unwrap();
    assert!(matches!(result, Err(BusError::ConsumerClosed(q)) if q == queue));
    assert_ne!(subscriber.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn cancel_lets_running_handler_finish() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let gate = Arc::new(Semaphore::new(0));
    let permits = Arc::clone(&gate);
    let finished = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&finished);
    let consumer = spawn_consume(&subscriber, move |_body: Vec<u8>| {
        let permits = Arc::clone(&permits);
        let done = Arc::clone(&done);
        async move {
            permits.acquire().await?.forget();
            done.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(())
        }
    });

    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();
    eventually("in flight", || subscriber.in_flight() == 1).await;

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());
    assert_eq!(subscriber.in_flight(), 1);

    publisher
        .send_message(&"o2", "order.create_order")
        .await
        .unwrap();
    gate.add_permits(10);

    eventually("running handler acked", || broker.stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(subscriber.stats().received, 1);
    assert_eq!(subscriber.stats().acked, 1);
}

#[tokio::test]
async fn handler_token_fires_on_cancel() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);
    let consumer = spawn_consume_with_token(
        &subscriber,
        move |_body: Vec<u8>, token: CancellationToken| {
            let flag = Arc::clone(&flag);
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        },
    );

    publisher
        .send_message(&"o1", "order.create_order")
        .await
        .unwrap();
    eventually("in flight", || subscriber.in_flight() == 1).await;
    assert!(!observed.load(Ordering::SeqCst));

    subscriber.cancel();
    assert!(consumer.await.unwrap().is_ok());

    eventually("token observed", || observed.load(Ordering::SeqCst)).await;
    eventually("acked", || broker.stats().acked == 1).await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_handlers() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok::<_, BoxError>(())
    });

    for order in ["o1", "o2", "o3"] {
        publisher
            .send_message(&order, "order.create_order")
            .await
            .unwrap();
    }
    eventually("all in flight", || subscriber.stats().received == 3).await;

    subscriber.shutdown().await.unwrap();

    assert_eq!(subscriber.in_flight(), 0);
    assert_eq!(broker.stats().acked, 3);
    assert_eq!(subscriber.state(), ConnectionState::Closed);
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn shutdown_gives_up_after_grace() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(
        &broker,
        &["order.*"],
        options().with_shutdown_grace(Duration::from_millis(50)),
    )
    .await;

    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, BoxError>(())
    });
    publisher
        .send_message(&"slow", "order.create_order")
        .await
        .unwrap();
    eventually("in flight", || subscriber.in_flight() == 1).await;

    let started = Instant::now();
    subscriber.shutdown().await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(subscriber.state(), ConnectionState::Closed);
    assert_eq!(broker.stats().acked, 0);
    assert!(consumer.await.unwrap().is_ok());
}

#[tokio::test]
async fn close_is_idempotent() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;
    let subscriber = subscriber(&broker, &["order.*"], options()).await;

    publisher.close().await.unwrap();
    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
    subscriber.close().await.unwrap();

    assert_eq!(publisher.state(), ConnectionState::Closed);
    assert_eq!(subscriber.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(
        publisher.send_message(&"late", "order.create_order").await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn close_during_reconnect_stays_closed() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(&broker, &["order.*"], options()).await;
    let queue = subscriber.queue_name();
    let consumer = spawn_consume(&subscriber, |_body: Vec<u8>| async { Ok::<_, BoxError>(()) });
    eventually("consumer attached", || broker.has_consumer(&queue)).await;

    broker.refuse_connections(true);
    broker.drop_connections();
    eventually("reconnecting", || {
        matches!(subscriber.state(), ConnectionState::Reconnecting { .. })
    })
    .await;

    subscriber.close().await.unwrap();
    assert_eq!(subscriber.state(), ConnectionState::Closed);

    broker.refuse_connections(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(subscriber.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert!(consumer.await.unwrap().is_ok());
}
