//! In-memory broker for testing and single-process scenarios.
//!
//! [`InMemoryBroker`] behaves like a topic-routing AMQP broker:
//!
//! - exchanges (topic, direct, fanout) and the default `""` exchange, which
//!   routes straight to the queue named by the routing key
//! - exclusive, auto-delete, server-named queues
//! - manual acknowledgement with prefetch limits per channel
//! - `nack(requeue = true)` puts the message back at the head of its queue
//!   and marks it redelivered; every delivery carries a delivery count
//! - closing a channel requeues its unacknowledged messages; closing a
//!   connection deletes the exclusive queues it owns and ends their consumers
//!
//! It also exposes fault injection (refused connections, failing bindings,
//! rejected or slow publishes, dropped connections) and inspection helpers
//! so tests can assert on what the broker saw. The publish and settlement
//! logs behind those helpers keep the most recent
//! [`DEFAULT_RECORD_LIMIT`] entries; see [`InMemoryBroker::with_record_limit`].
//!
//! ## Example
//!
//! ```
//! use topic_bus::broker::{Broker, Channel, Connection, InMemoryBroker, OutboundMessage};
//! use topic_bus::ExchangeKind;
//!
//! # tokio_test_block(async {
//! let broker = InMemoryBroker::new();
//! let conn = broker.connect("memory://").await.unwrap();
//! let channel = conn.open_channel().await.unwrap();
//!
//! channel.declare_exchange("shop", ExchangeKind::Topic, true).await.unwrap();
//! let queue = channel.declare_exclusive_queue().await.unwrap();
//! channel.bind_queue(&queue, "shop", "product.*").await.unwrap();
//!
//! channel
//!     .publish("shop", "product.create_product", OutboundMessage::new(b"hi".to_vec()))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(broker.ready_count(&queue), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{
    Acker, Broker, Channel, Connection, Delivery, DeliveryStream, OutboundMessage,
};
use crate::config::ExchangeKind;
use crate::error::BusError;
use crate::topic::BindingPattern;

/// Name of the default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Entries kept in each inspection log (publishes, settlements).
pub const DEFAULT_RECORD_LIMIT: usize = 10_000;

/// A message as it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub seq: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Acked,
    Requeued,
    Rejected,
}

/// One settlement, in the order the broker processed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub seq: u64,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub delivery_count: u32,
    pub outcome: SettleOutcome,
}

/// Counters across the broker's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: usize,
    pub unroutable: usize,
    pub delivered: usize,
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
}

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    deliveries: u32,
}

struct Consumer {
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    owner: u64,
    auto_delete: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, StoredMessage>,
    consumer: Option<Consumer>,
    max_unacked: usize,
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
}

#[derive(Default)]
struct Faults {
    refuse_connections: bool,
    reject_publishes: bool,
    failing_bindings: HashSet<String>,
    publish_delay: Option<Duration>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    /// Open connections only; closed ones are forgotten.
    connections: HashSet<u64>,
    /// Open channels only.
    channels: HashMap<u64, ChannelEntry>,
    tag_index: HashMap<u64, String>,
    published: VecDeque<PublishedMessage>,
    settlements: VecDeque<Settlement>,
    record_limit: usize,
    stats: BrokerStats,
    faults: Faults,
    next_id: u64,
}

type Shared = Arc<Mutex<BrokerState>>;

/// Append to a bounded log, evicting the oldest entry when full.
fn record<T>(log: &mut VecDeque<T>, limit: usize, entry: T) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(entry);
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_usable(&self, channel: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|c| self.connections.contains(&c.connection))
    }

    /// Push ready messages to the queue's consumer until the prefetch window
    /// is full.
    fn pump(&mut self, queue_name: &str, shared: &Weak<Mutex<BrokerState>>) {
        let next_id = &mut self.next_id;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(consumer) = &queue.consumer else {
            return;
        };
        let prefetch = self
            .channels
            .get(&consumer.channel)
            .map(|c| c.prefetch as usize)
            .unwrap_or(0);
        let channel = consumer.channel;

        while prefetch == 0 || queue.unacked.len() < prefetch {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            *next_id += 1;
            let tag = *next_id;
            message.deliveries += 1;

            let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
                state: shared.clone(),
                channel,
            });
            let delivery = Delivery::new(
                message.body.clone(),
                message.exchange.clone(),
                message.routing_key.clone(),
                tag,
                acker,
            )
            .with_redelivered(message.deliveries > 1)
            .with_delivery_count(Some(message.deliveries))
            .with_message_id(message.message_id.clone());

            let sent = queue
                .consumer
                .as_ref()
                .map(|c| c.tx.send(delivery).is_ok())
                .unwrap_or(false);
            if !sent {
                // Receiver dropped: the consumer is gone.
                message.deliveries -= 1;
                queue.ready.push_front(message);
                queue.consumer = None;
                break;
            }

            queue.unacked.insert(tag, message);
            queue.max_unacked = queue.max_unacked.max(queue.unacked.len());
            self.tag_index.insert(tag, queue_name.to_string());
            self.stats.delivered += 1;
        }
    }

    fn settle(
        &mut self,
        channel: u64,
        tag: u64,
        outcome: SettleOutcome,
        shared: &Weak<Mutex<BrokerState>>,
    ) -> Result<(), BusError> {
        if !self.channel_usable(channel) {
            return Err(BusError::ChannelClosed);
        }
        let unknown = || BusError::Settle {
            delivery_tag: tag,
            reason: "unknown delivery tag".into(),
        };
        let queue_name = self.tag_index.remove(&tag).ok_or_else(unknown)?;
        let queue = self.queues.get_mut(&queue_name).ok_or_else(unknown)?;
        let message = queue.unacked.remove(&tag).ok_or_else(unknown)?;

        record(
            &mut self.settlements,
            self.record_limit,
            Settlement {
                queue: queue_name.clone(),
                seq: message.seq,
                routing_key: message.routing_key.clone(),
                delivery_tag: tag,
                delivery_count: message.deliveries,
                outcome,
            },
        );

        match outcome {
            SettleOutcome::Acked => self.stats.acked += 1,
            SettleOutcome::Requeued => {
                self.stats.requeued += 1;
                queue.ready.push_front(message);
            }
            SettleOutcome::Rejected => self.stats.rejected += 1,
        }

        self.pump(&queue_name, shared);
        Ok(())
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BusError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if kind.routes(routing_key, &binding.pattern) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
        shared: &Weak<Mutex<BrokerState>>,
    ) -> Result<(), BusError> {
        if self.faults.reject_publishes {
            return Err(BusError::Publish {
                routing_key: routing_key.to_string(),
                reason: "publish rejected by broker".into(),
            });
        }
        let targets = self.route(exchange, routing_key)?;
        let seq = self.next_id();

        record(
            &mut self.published,
            self.record_limit,
            PublishedMessage {
                seq,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: message.body.clone(),
                content_type: message.content_type.clone(),
                message_id: message.message_id.clone(),
                app_id: message.app_id.clone(),
            },
        );
        self.stats.published += 1;

        if targets.is_empty() {
            self.stats.unroutable += 1;
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(StoredMessage {
                    seq,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: message.body.clone(),
                    message_id: message.message_id.clone(),
                    deliveries: 0,
                });
            }
            self.pump(&target, shared);
        }
        Ok(())
    }

    /// Detach consumers on `channel` and requeue what they held.
    fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.consumer.as_ref().map(|c| c.channel) != Some(channel) {
                continue;
            }
            queue.consumer = None;
            let unacked = std::mem::take(&mut queue.unacked);
            for (tag, message) in unacked.into_iter().rev() {
                self.tag_index.remove(&tag);
                queue.ready.push_front(message);
            }
            if queue.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            for tag in queue.unacked.keys() {
                self.tag_index.remove(tag);
            }
        }
        self.bindings.retain(|b| b.queue != name);
    }
}

/// In-memory topic broker.
///
/// Cheap to clone; clones share the same broker state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Shared,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_record_limit(DEFAULT_RECORD_LIMIT)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` entries in each inspection log. `0` turns the
    /// logs off; [`stats`](Self::stats) keeps counting either way.
    pub fn with_record_limit(limit: usize) -> Self {
        let state = BrokerState {
            record_limit: limit,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    /// Make new connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().faults.refuse_connections = refuse;
    }

    /// Make every bind of `pattern` fail.
    pub fn fail_binding(&self, pattern: impl Into<String>) {
        self.state().faults.failing_bindings.insert(pattern.into());
    }

    /// Make publishes fail.
    pub fn reject_publishes(&self, reject: bool) {
        self.state().faults.reject_publishes = reject;
    }

    /// Delay every publish by `delay` before the broker accepts it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().faults.publish_delay = delay;
    }

    /// Drop every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let open: Vec<u64> = state.connections.iter().copied().collect();
        for id in open {
            state.close_connection(id);
        }
    }

    /// Publish raw bytes without going through a connection.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), BusError> {
        let weak = Arc::downgrade(&self.state);
        self.state().publish(
            exchange,
            routing_key,
            OutboundMessage::new(body.into()),
            &weak,
        )
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Recorded publishes, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.iter().cloned().collect()
    }

    /// Messages published with exactly `routing_key`.
    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Recorded settlements, in the order the broker processed them.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state().stats
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(name).copied()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Patterns bound to `queue`, in bind order.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Messages waiting in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Highest number of unacknowledged messages `queue` ever had.
    pub fn max_unacked(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.max_unacked)
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, uri: &str) -> Result<MemoryConnection, BusError> {
        let mut state = self.state();
        if state.faults.refuse_connections {
            return Err(BusError::Connect(format!("{uri}: connection refused")));
        }
        let id = state.next_id();
        state.connections.insert(id);
        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: Shared,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, BusError> {
        let mut state = lock(&self.state);
        if !state.connections.contains(&self.id) {
            return Err(BusError::Channel("connection is closed".into()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
            },
        );
        Ok(MemoryChannel {
            id,
            connection: self.id,
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        lock(&self.state).close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).connections.contains(&self.id)
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Shared,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish()
    }
}

impl MemoryChannel {
    fn usable(&self) -> Result<MutexGuard<'_, BrokerState>, BusError> {
        let state = lock(&self.state);
        if state.channel_usable(self.id) {
            Ok(state)
        } else {
            Err(BusError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BusError> {
        let mut state = self.usable()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::DeclareExchange {
                exchange: name.to_string(),
                reason: format!("already declared as {existing}, not {kind}"),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_exclusive_queue(&self) -> Result<String, BusError> {
        let mut state = self.usable()?;
        let name = format!("amq.gen-{}", state.next_id());
        state.queues.insert(
            name.clone(),
            Queue {
                owner: self.connection,
                auto_delete: true,
                ready: VecDeque::new(),
                unacked: BTreeMap::new(),
                consumer: None,
                max_unacked: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BusError> {
        let mut state = self.usable()?;
        let fail = |reason: String| BusError::Bind {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            reason,
        };

        if state.faults.failing_bindings.contains(pattern) {
            return Err(fail("binding refused by broker".into()));
        }
        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| fail("no such exchange".into()))?;
        if !state.queues.contains_key(queue) {
            return Err(fail(format!("no queue `{queue}`")));
        }
        if kind == ExchangeKind::Topic {
            BindingPattern::parse(pattern).map_err(|e| fail(e.to_string()))?;
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BusError> {
        let mut state = self.usable()?;
        if let Some(entry) = state.channels.get_mut(&self.id) {
            entry.prefetch = count;
        }
        let consumed: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.consumer.as_ref().map(|c| c.channel) == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        let weak = Arc::downgrade(&self.state);
        for queue in consumed {
            state.pump(&queue, &weak);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BusError> {
        let delay = self.usable()?.faults.publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let weak = Arc::downgrade(&self.state);
        self.usable()?.publish(exchange, routing_key, message, &weak)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BusError> {
        let mut state = self.usable()?;
        let entry = state.queues.get_mut(queue).ok_or_else(|| BusError::Consume {
            queue: queue.to_string(),
            reason: "no such queue".into(),
        })?;
        if entry.consumer.is_some() {
            return Err(BusError::Consume {
                queue: queue.to_string(),
                reason: "queue already has an exclusive consumer".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumer = Some(Consumer {
            channel: self.id,
            tx,
        });
        let weak = Arc::downgrade(&self.state);
        state.pump(queue, &weak);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).channel_usable(self.id)
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: u64,
}

impl MemoryAcker {
    fn settle(&self, tag: u64, outcome: SettleOutcome) -> Result<(), BusError> {
        let shared = self.state.upgrade().ok_or(BusError::ChannelClosed)?;
        let mut state = lock(&shared);
        state.settle(self.channel, tag, outcome, &self.state)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.settle(delivery_tag, SettleOutcome::Acked)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        let outcome = if requeue {
            SettleOutcome::Requeued
        } else {
            SettleOutcome::Rejected
        };
        self.settle(delivery_tag, outcome)
    }
}
