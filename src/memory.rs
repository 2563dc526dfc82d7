// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! [`InMemoryBroker`] implements both broker planes without a RabbitMQ server: topic,
//! direct, fanout and headers routing, competing consumers with round-robin dispatch
//! and prefetch, acknowledgements, requeue and dead lettering, auto-delete queues and
//! publisher confirms. It also exposes failure knobs (unavailable endpoints, severed
//! connections, failing admin calls, nacked publishes) so reconnection and retry
//! paths can be exercised locally.
//!
//! Routing for headers exchanges ignores header matching and delivers to every bound
//! queue.

use crate::{
    broker::{
        BrokerAdmin, BrokerChannel, BrokerConnection, Confirmation, Connector, Delivery,
        DeliveryAcker, DeliveryStream, MessageProperties, OutboundMessage,
    },
    errors::BinderError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    channel: u64,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery, BinderError>>,
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: String,
    connection: u64,
    channel: u64,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
    had_consumer: bool,
}

impl QueueState {
    fn new(def: QueueDefinition) -> Self {
        QueueState {
            def,
            ready: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
            unacked: HashMap::new(),
            had_consumer: false,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    channels: HashMap<u64, (u64, Arc<AtomicBool>)>,
    unavailable_endpoints: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    unavailable: AtomicBool,
    next_id: AtomicU64,
    connections_opened: AtomicUsize,
    admin_calls: AtomicUsize,
    exchange_declarations: AtomicUsize,
    admin_failures: AtomicU32,
    admin_latency_ms: AtomicU64,
    nacks: AtomicU32,
}

/// An in-process broker implementing [`Connector`] and [`BrokerAdmin`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Makes every endpoint refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_endpoint_available(&self, address: &str, available: bool) {
        let mut state = self.shared.state.lock();
        if available {
            state.unavailable_endpoints.remove(address);
        } else {
            state.unavailable_endpoints.insert(address.to_owned());
        }
    }

    /// Closes every open connection, as a broker restart or network partition would.
    /// Unacknowledged deliveries are requeued as redelivered.
    pub fn sever_connections(&self) {
        let mut state = self.shared.state.lock();

        let severed: HashSet<u64> = state
            .connections
            .drain()
            .map(|(id, open)| {
                open.store(false, Ordering::SeqCst);
                id
            })
            .collect();
        state
            .channels
            .retain(|_, (connection, _)| !severed.contains(connection));

        debug!(connections = severed.len(), "severing broker connections");
        self.release(&mut state, |connection, _| severed.contains(&connection));
    }

    /// Closes the channels consuming from `queue` while their connections stay open,
    /// as the broker does on a channel-level error. Returns the number of channels closed.
    pub fn close_consumer_channels(&self, queue: &str) -> usize {
        let mut state = self.shared.state.lock();

        let closed: HashSet<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel).collect())
            .unwrap_or_default();

        for id in &closed {
            if let Some((_, open)) = state.channels.remove(id) {
                open.store(false, Ordering::SeqCst);
            }
        }

        debug!(queue = queue, channels = closed.len(), "closing consumer channels");
        self.release(&mut state, |_, channel| closed.contains(&channel));
        closed.len()
    }

    /// Fails the next `count` admin calls with `ConnectionLost`.
    pub fn fail_next_admin_calls(&self, count: u32) {
        self.shared.admin_failures.store(count, Ordering::SeqCst);
    }

    /// Delays every admin call.
    pub fn set_admin_latency(&self, latency: Duration) {
        self.shared
            .admin_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Negatively confirms the next `count` publishes on confirm channels.
    pub fn nack_next_publishes(&self, count: u32) {
        self.shared.nacks.store(count, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections_opened.load(Ordering::SeqCst)
    }

    pub fn admin_calls(&self) -> usize {
        self.shared.admin_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_declarations(&self) -> usize {
        self.shared.exchange_declarations.load(Ordering::SeqCst)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    pub fn queue_definition(&self, name: &str) -> Option<QueueDefinition> {
        self.shared.state.lock().queues.get(name).map(|q| q.def.clone())
    }

    /// Queues bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .map(|b| b.queue_name.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<OutboundMessage> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| OutboundMessage {
                        body: m.body.clone(),
                        properties: m.properties.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Publishes directly, bypassing any binder, e.g. to simulate a foreign producer.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BinderError> {
        let mut state = self.shared.state.lock();
        self.route(
            &mut state,
            exchange,
            routing_key,
            StoredMessage {
                body: message.body,
                properties: message.properties,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
            },
        )
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn route(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<(), BinderError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let Some(def) = state.exchanges.get(exchange) else {
                return Err(BinderError::PublishingError(format!(
                    "no exchange `{}`",
                    exchange
                )));
            };

            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| match def.kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|b| b.queue_name.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        trace!(
            exchange = exchange,
            routing_key = routing_key,
            queues = targets.len(),
            "routing message"
        );

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
                self.dispatch(state, &target);
            }
        }

        Ok(())
    }

    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| {
                    let slot = &queue.consumers[*idx];
                    let in_flight = queue
                        .unacked
                        .values()
                        .filter(|u| u.consumer_tag == slot.tag)
                        .count();
                    slot.prefetch == 0 || in_flight < slot.prefetch as usize
                });

            let Some(idx) = chosen else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            queue.next_consumer = (idx + 1) % count;
            let tag = self.next_id();
            let delivery = Delivery::new(
                message.body.clone(),
                message.properties.clone(),
                &message.exchange,
                &message.routing_key,
                message.redelivered,
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue_name.to_owned(),
                    tag,
                }),
            );

            let slot = &queue.consumers[idx];
            if slot.sender.send(Ok(delivery)).is_err() {
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            queue.unacked.insert(
                tag,
                Unacked {
                    message,
                    consumer_tag: slot.tag.clone(),
                    connection: slot.connection,
                    channel: slot.channel,
                },
            );
        }
    }

    /// Drops consumers and requeues unacked deliveries matching `owned(connection, channel)`.
    fn release(&self, state: &mut BrokerState, owned: impl Fn(u64, u64) -> bool) {
        let mut deleted = vec![];

        for (name, queue) in state.queues.iter_mut() {
            queue.consumers.retain(|c| !owned(c.connection, c.channel));

            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| owned(u.connection, u.channel))
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));

            for tag in tags {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }

            if queue.def.delete && queue.had_consumer && queue.consumers.is_empty() {
                deleted.push(name.clone());
            }
        }

        self.delete_queues(state, &deleted);

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(state, &name);
        }
    }

    fn delete_queues(&self, state: &mut BrokerState, names: &[String]) {
        for name in names {
            debug!(queue = name.as_str(), "auto-deleting queue");
            state.queues.remove(name);
            state.bindings.retain(|b| &b.queue_name != name);
        }
    }

    fn settle(&self, queue_name: &str, tag: u64, ack: bool, requeue: bool) -> Result<(), BinderError> {
        let mut state = self.shared.state.lock();

        let unacked = state
            .queues
            .get_mut(queue_name)
            .and_then(|q| q.unacked.remove(&tag));

        let Some(unacked) = unacked else {
            return Err(if ack {
                BinderError::AckMessageError
            } else {
                BinderError::NackMessageError
            });
        };

        if !ack {
            let mut message = unacked.message;

            if requeue {
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.ready.push_front(message);
                }
            } else {
                let dead_letter = state.queues.get(queue_name).and_then(|q| {
                    q.def.dead_letter_exchange.clone().map(|exchange| {
                        let key = q
                            .def
                            .dead_letter_routing_key
                            .clone()
                            .unwrap_or_else(|| message.routing_key.clone());
                        (exchange, key)
                    })
                });

                if let Some((exchange, key)) = dead_letter {
                    message.exchange = exchange.clone();
                    message.routing_key = key.clone();
                    self.route(&mut state, &exchange, &key, message)?;
                }
            }
        }

        self.dispatch(&mut state, queue_name);
        Ok(())
    }

    async fn admin_call(&self) -> Result<(), BinderError> {
        let latency = self.shared.admin_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.shared.admin_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .shared
            .admin_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing || self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BinderError::ConnectionLost("admin connection refused".to_owned()));
        }

        Ok(())
    }
}

/// Topic pattern matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        address: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BinderError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BinderError::ConnectionError(address.to_owned()));
        }

        let id = self.next_id();
        let open = Arc::new(AtomicBool::new(true));
        {
            let mut state = self.shared.state.lock();
            if state.unavailable_endpoints.contains(address) {
                return Err(BinderError::ConnectionError(address.to_owned()));
            }
            state.connections.insert(id, open.clone());
        }

        self.shared.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            open,
        }))
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BinderError> {
        self.admin_call().await?;
        self.shared.exchange_declarations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.shared.state.lock();
        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(BinderError::TopologyConflict(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BinderError> {
        self.admin_call().await?;

        let mut state = self.shared.state.lock();
        match state.queues.get(&def.name) {
            Some(existing) if &existing.def != def => {
                Err(BinderError::TopologyConflict(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(def.name.clone(), QueueState::new(def.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BinderError> {
        self.admin_call().await?;

        let mut state = self.shared.state.lock();
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(BinderError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BinderError> {
        if !self.is_open() {
            return Err(BinderError::ConnectionLost("connection closed".to_owned()));
        }

        let id = self.broker.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.broker
            .shared
            .state
            .lock()
            .channels
            .insert(id, (self.id, open.clone()));

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            connection_open: self.open.clone(),
            id,
            open,
            confirms: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), BinderError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.shared.state.lock();
        state.connections.remove(&self.id);
        let id = self.id;
        state.channels.retain(|_, (connection, _)| *connection != id);
        self.broker.release(&mut state, |connection, _| connection == id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    connection_open: Arc<AtomicBool>,
    id: u64,
    open: Arc<AtomicBool>,
    confirms: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BinderError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            Err(BinderError::ConnectionLost("connection closed".to_owned()))
        } else if !self.open.load(Ordering::SeqCst) {
            Err(BinderError::ChannelError("channel closed".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn enable_confirms(&self) -> Result<(), BinderError> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BinderError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<Confirmation, BinderError> {
        self.ensure_open()?;

        let confirms = self.confirms.load(Ordering::SeqCst);
        if confirms
            && self
                .broker
                .shared
                .nacks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(Confirmation::Nack);
        }

        self.broker.publish(exchange, routing_key, message.clone())?;

        Ok(if confirms {
            Confirmation::Ack
        } else {
            Confirmation::NotRequested
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BinderError> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.shared.state.lock();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(BinderError::ConsumerDeclarationError(queue.to_owned()));
            };

            queue_state.had_consumer = true;
            queue_state.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_owned(),
                connection: self.connection,
                channel: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                sender,
            });

            self.broker.dispatch(&mut state, queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BinderError> {
        let mut state = self.broker.shared.state.lock();
        let mut deleted = vec![];

        for (name, queue) in state.queues.iter_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));

            if queue.def.delete && queue.had_consumer && queue.consumers.is_empty() {
                deleted.push(name.clone());
            }
        }

        self.broker.delete_queues(&mut state, &deleted);
        Ok(())
    }

    async fn close(&self) -> Result<(), BinderError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.shared.state.lock();
        let id = self.id;
        state.channels.remove(&id);
        self.broker.release(&mut state, |_, channel| channel == id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), BinderError> {
        self.broker.settle(&self.queue, self.tag, true, false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BinderError> {
        self.broker.settle(&self.queue, self.tag, false, requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.as_bytes().to_vec(),
            properties: MessageProperties::default(),
        }
    }

    async fn declare(broker: &InMemoryBroker, exchange: &str, queue: &str, key: &str) {
        broker
            .declare_exchange(&ExchangeDefinition::new(exchange).topic())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new(queue))
            .await
            .unwrap();
        broker
            .bind_queue(&QueueBinding::new(queue).exchange(exchange).routing_key(key))
            .await
            .unwrap();
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("#", "orders"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(!topic_matches("orders-1", "orders-0"));
    }

    #[tokio::test]
    async fn redeclaring_with_other_attributes_conflicts() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDefinition::new("orders.billing").durable())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders.billing").durable())
            .await
            .unwrap();

        let err = broker
            .declare_queue(&QueueDefinition::new("orders.billing"))
            .await
            .unwrap_err();

        assert_eq!(err, BinderError::TopologyConflict("orders.billing".to_owned()));
    }

    #[tokio::test]
    async fn competing_consumers_receive_round_robin() {
        let broker = InMemoryBroker::new();
        declare(&broker, "orders", "orders.billing", "#").await;

        let conn = broker.connect("local", "test").await.unwrap();
        let first = conn.create_channel().await.unwrap();
        let second = conn.create_channel().await.unwrap();
        let mut a = first.consume("orders.billing", "a").await.unwrap();
        let mut b = second.consume("orders.billing", "b").await.unwrap();

        broker.publish("orders", "orders", message("1")).unwrap();
        broker.publish("orders", "orders", message("2")).unwrap();

        let from_a = a.next().await.unwrap().unwrap();
        let from_b = b.next().await.unwrap().unwrap();

        assert_eq!(from_a.body, b"1".to_vec());
        assert_eq!(from_b.body, b"2".to_vec());
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        declare(&broker, "orders", "orders.billing", "#").await;

        let conn = broker.connect("local", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        let mut deliveries = channel.consume("orders.billing", "a").await.unwrap();

        broker.publish("orders", "orders", message("1")).unwrap();
        broker.publish("orders", "orders", message("2")).unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.messages("orders.billing").len(), 1);

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2".to_vec());
    }

    #[tokio::test]
    async fn severed_connections_requeue_unacked_messages() {
        let broker = InMemoryBroker::new();
        declare(&broker, "orders", "orders.billing", "#").await;

        let conn = broker.connect("local", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let mut deliveries = channel.consume("orders.billing", "a").await.unwrap();

        broker.publish("orders", "orders", message("1")).unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        broker.sever_connections();

        assert!(!conn.is_open());
        assert!(deliveries.next().await.is_none());
        assert!(delivery.ack().await.is_err());

        let requeued = broker.messages("orders.billing");
        assert_eq!(requeued.len(), 1);
    }

    #[tokio::test]
    async fn closing_a_consumer_channel_keeps_its_connection() {
        let broker = InMemoryBroker::new();
        declare(&broker, "orders", "orders.billing", "#").await;

        let conn = broker.connect("local", "test").await.unwrap();
        let consuming = conn.create_channel().await.unwrap();
        let publishing = conn.create_channel().await.unwrap();
        let mut deliveries = consuming.consume("orders.billing", "a").await.unwrap();

        broker.publish("orders", "orders", message("1")).unwrap();
        deliveries.next().await.unwrap().unwrap();

        assert_eq!(broker.close_consumer_channels("orders.billing"), 1);

        assert!(conn.is_open());
        assert!(publishing.is_open());
        assert!(!consuming.is_open());
        assert!(deliveries.next().await.is_none());
        assert!(matches!(
            consuming.publish("orders", "orders", &message("2")).await,
            Err(BinderError::ChannelError(_))
        ));
        assert_eq!(broker.messages("orders.billing").len(), 1);
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new("DLX").direct())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders.billing.dlq"))
            .await
            .unwrap();
        broker
            .bind_queue(
                &QueueBinding::new("orders.billing.dlq")
                    .exchange("DLX")
                    .routing_key("orders.billing"),
            )
            .await
            .unwrap();
        broker
            .declare_exchange(&ExchangeDefinition::new("orders").topic())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders.billing").dead_letter("DLX", "orders.billing"))
            .await
            .unwrap();
        broker
            .bind_queue(&QueueBinding::new("orders.billing").exchange("orders").routing_key("#"))
            .await
            .unwrap();

        let conn = broker.connect("local", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let mut deliveries = channel.consume("orders.billing", "a").await.unwrap();

        broker.publish("orders", "orders", message("bad")).unwrap();
        deliveries.next().await.unwrap().unwrap().nack(false).await.unwrap();

        assert_eq!(broker.messages("orders.billing.dlq").len(), 1);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_away_with_its_last_consumer() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new("orders").topic())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders.anonymous.x").delete())
            .await
            .unwrap();

        let conn = broker.connect("local", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let _deliveries = channel.consume("orders.anonymous.x", "a").await.unwrap();

        channel.cancel("a").await.unwrap();

        assert!(!broker.has_queue("orders.anonymous.x"));
    }
}
