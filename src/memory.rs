// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local implementation of the channel contract, meant for tests.
//! It models the parts of RabbitMQ the adapter relies on: the default,
//! direct, fanout and topic exchanges, durable assertions that are idempotent
//! for identical properties, manual acknowledgements with requeue and the
//! `redelivered` flag, and the direct reply-to pseudo-queue.
//!
//! Headers exchanges route like fanout exchanges here.
//!
//! Every publish, ack and nack is recorded so tests can assert on them.

use crate::{
    channel::{
        AmqpChannel, ChannelFactory, ConnectionManager, Delivery, DeliveryStream,
        MessageProperties, DIRECT_REPLY_QUEUE,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    resilient::ResilientChannel,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::debug;

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// A negative acknowledgement received by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRecord {
    pub delivery_tag: u64,
    pub requeue: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, Unacked>,
    reply_queues: HashMap<u64, String>,
    open_channels: HashSet<u64>,
    next_tag: u64,
    next_channel: u64,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    nacked: Vec<NackRecord>,
    closed: bool,
}

/// In-process stand-in for a RabbitMQ server and its connection manager.
///
/// Like RabbitMQ, the broker closes a channel on a channel-level error: a
/// publish to a missing exchange, an unknown delivery tag, an inequivalent or
/// failed declaration, a consumer on a missing queue. Channels returned by
/// `create_channel` are `ResilientChannel`s and recover from that.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates a connection blip: the broker closes every open channel and
    /// requeues their unacked messages.
    ///
    /// # Returns
    /// The number of channels closed
    pub fn drop_channels(&self) -> usize {
        let mut state = self.state();
        let channels: Vec<u64> = state.open_channels.iter().copied().collect();

        for id in &channels {
            state.close_channel(*id);
        }

        channels.len()
    }

    /// Every message accepted by a publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn nacked(&self) -> Vec<NackRecord> {
        self.state().nacked.clone()
    }

    /// Number of ready (undelivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Number of delivered messages still waiting for an ack or nack.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn open_channels(&self) -> usize {
        self.state().open_channels.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl ChannelFactory for InMemoryBroker {
    async fn open_channel(&self, _confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state();
        if state.closed {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);

        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.clone(),
        }))
    }
}

#[async_trait]
impl ConnectionManager for InMemoryBroker {
    async fn create_channel(
        &self,
        setup: Arc<AmqpTopology>,
        confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = ResilientChannel::open(Arc::new(self.clone()), setup, confirm).await?;

        Ok(Arc::new(channel))
    }

    async fn wait_for_connect(&self) -> Result<(), AmqpError> {
        if self.state().closed {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state();
        let channels: Vec<u64> = state.open_channels.iter().copied().collect();
        for id in channels {
            state.close_channel(id);
        }
        state.closed = true;
        Ok(())
    }
}

/// A bare channel on an `InMemoryBroker`.
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.state();
        if state.closed {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }
        if !state.open_channels.contains(&self.id) {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        Ok(state)
    }

    /// Closes the channel the way the broker does on a channel exception.
    fn fail<T>(
        &self,
        mut state: MutexGuard<'_, BrokerState>,
        err: AmqpError,
    ) -> Result<T, AmqpError> {
        debug!(
            channel = self.id,
            error = err.to_string(),
            "channel closed by the broker"
        );
        state.close_channel(self.id);
        Err(err)
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        let equivalent = state
            .exchanges
            .get(&def.name)
            .map(|existing| existing.kind == def.kind && existing.durable == def.durable);

        match equivalent {
            Some(true) => Ok(()),
            Some(false) => {
                let err =
                    AmqpError::DeclareExchangeError(format!("{}: inequivalent arguments", def.name));
                self.fail(state, err)
            }
            None if def.passive => {
                let err = AmqpError::DeclareExchangeError(format!("{}: not found", def.name));
                self.fail(state, err)
            }
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        let equivalent = state.queues.get(&def.name).map(|existing| {
            existing.def.durable == def.durable && existing.def.arguments() == def.arguments()
        });

        match equivalent {
            Some(true) => Ok(()),
            Some(false) => {
                let err =
                    AmqpError::DeclareQueueError(format!("{}: inequivalent arguments", def.name));
                self.fail(state, err)
            }
            None if def.passive => {
                let err = AmqpError::DeclareQueueError(format!("{}: not found", def.name));
                self.fail(state, err)
            }
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            let err = AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            );
            return self.fail(state, err);
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn basic_qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.open_state().map(|_| ())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        mut properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) {
            match state.reply_queues.get(&self.id).cloned() {
                Some(address) => properties.reply_to = Some(address),
                None => {
                    let err = AmqpError::PublishingError(
                        "fast reply consumer does not exist on this channel".to_owned(),
                    );
                    return self.fail(state, err);
                }
            }
        }

        let targets = match state.route(exchange, routing_key) {
            Ok(targets) => targets,
            Err(err) => return self.fail(state, err),
        };

        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: payload.to_vec(),
        });

        debug!(exchange, routing_key, queues = targets.len(), "message routed");

        for queue in targets {
            state.enqueue(
                &queue,
                StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: properties.clone(),
                    data: payload.to_vec(),
                    redelivered: false,
                },
            );
        }

        Ok(())
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;

        let queue_name = if queue == DIRECT_REPLY_QUEUE {
            if !no_ack {
                return self.fail(state, AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            let address = format!("{}.{}", DIRECT_REPLY_QUEUE, self.id);
            state.reply_queues.insert(self.id, address.clone());
            state.queues.entry(address.clone()).or_insert_with(|| QueueState {
                def: QueueDefinition::new(&address).transient().exclusive(),
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            });
            address
        } else {
            queue.to_owned()
        };

        if !state.queues.contains_key(&queue_name) {
            return self.fail(state, AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(&queue_name) {
            q.consumers.push(Consumer {
                channel_id: self.id,
                no_ack,
                tx,
            });
        }
        state.dispatch(&queue_name);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.owns(self.id, delivery_tag) {
            return self.fail(state, AmqpError::AckMessageError);
        }
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);

        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.owns(self.id, delivery_tag) {
            return self.fail(state, AmqpError::NackMessageError);
        }

        let tags: Vec<u64> = if multiple {
            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(tag, u)| u.channel_id == self.id && **tag <= delivery_tag)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            tags
        } else {
            vec![delivery_tag]
        };

        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                state.nacked.push(NackRecord {
                    delivery_tag: tag,
                    requeue,
                });
                if requeue {
                    state.requeue(unacked);
                }
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open_state().is_ok()
    }
}

impl BrokerState {
    fn owns(&self, channel_id: u64, delivery_tag: u64) -> bool {
        self.unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.channel_id == channel_id)
    }

    /// Drops the channel's consumers and reply address, then requeues the
    /// messages it left unacked.
    fn close_channel(&mut self, channel_id: u64) {
        if !self.open_channels.remove(&channel_id) {
            return;
        }

        if let Some(address) = self.reply_queues.remove(&channel_id) {
            self.queues.remove(&address);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable();
        for tag in orphaned.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let def = self.exchanges.get(exchange).ok_or_else(|| {
            AmqpError::PublishingError(format!("no exchange `{exchange}`"))
        })?;

        let mut targets: Vec<String> = self
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

        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
            self.dispatch(queue);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let mut message = unacked.message;
        message.redelivered = true;

        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            q.ready.push_front(message);
            self.dispatch(&unacked.queue);
        }
    }

    fn dispatch(&mut self, queue: &str) {
        let BrokerState {
            queues,
            unacked,
            next_tag,
            ..
        } = self;

        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while let Some(message) = q.ready.pop_front() {
            if q.consumers.is_empty() {
                q.ready.push_front(message);
                return;
            }

            let index = q.next_consumer % q.consumers.len();
            *next_tag += 1;
            let tag = *next_tag;

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            let consumer = &q.consumers[index];
            if consumer.tx.send(Ok(delivery)).is_err() {
                q.consumers.remove(index);
                q.ready.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_owned(),
                        channel_id: consumer.channel_id,
                        message,
                    },
                );
            }
            q.next_consumer = index + 1;
        }
    }
}

/// Matches a routing key against a topic binding pattern, where `*` stands for
/// exactly one word and `#` for zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    matches(&pattern, &words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created.#", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn AmqpChannel> {
        let setup = AmqpTopology::new()
            .assert_exchange("X")
            .assert_queue("Q")
            .bind_queue("Q", "X", "rk.*");

        let channel = broker.open_channel(true).await.unwrap();
        setup.install(channel.as_ref()).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn routes_through_topic_bindings() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        channel
            .basic_publish("X", "rk.one", b"1", MessageProperties::default())
            .await
            .unwrap();
        channel
            .basic_publish("X", "other", b"2", MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("Q"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn publishing_to_a_missing_exchange_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        let result = channel
            .basic_publish("missing", "rk", b"{}", MessageProperties::default())
            .await;

        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
        assert!(!channel.is_open());
        assert_eq!(broker.open_channels(), 0);
        assert!(matches!(
            channel
                .basic_publish("X", "rk.a", b"1", MessageProperties::default())
                .await,
            Err(AmqpError::ChannelError(_))
        ));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let mut deliveries = channel.basic_consume("Q", false).await.unwrap();

        channel
            .basic_publish("X", "rk.a", b"1", MessageProperties::default())
            .await
            .unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel
            .basic_nack(first.delivery_tag, false, true)
            .await
            .unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        channel.basic_ack(second.delivery_tag).await.unwrap();

        assert_eq!(
            broker.nacked(),
            vec![NackRecord {
                delivery_tag: first.delivery_tag,
                requeue: true
            }]
        );
        assert_eq!(broker.acked(), vec![second.delivery_tag]);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn acking_an_unknown_tag_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        assert_eq!(channel.basic_ack(42).await, Err(AmqpError::AckMessageError));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn direct_reply_requires_a_reply_consumer() {
        let broker = InMemoryBroker::new();
        let props = MessageProperties {
            reply_to: Some(DIRECT_REPLY_QUEUE.to_owned()),
            ..MessageProperties::default()
        };

        let without_consumer = channel(&broker).await;
        let result = without_consumer
            .basic_publish("X", "rk.a", b"1", props.clone())
            .await;
        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
        assert!(!without_consumer.is_open());

        let channel = channel(&broker).await;
        let mut replies = channel.basic_consume(DIRECT_REPLY_QUEUE, true).await.unwrap();
        let mut requests = channel.basic_consume("Q", false).await.unwrap();
        channel.basic_publish("X", "rk.a", b"1", props).await.unwrap();

        let request = requests.next().await.unwrap().unwrap();
        let reply_to = request.properties.reply_to.unwrap();
        assert_ne!(reply_to, DIRECT_REPLY_QUEUE);

        channel
            .basic_publish("", &reply_to, b"2", MessageProperties::default())
            .await
            .unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply.data, b"2");
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn asserting_inequivalent_exchange_fails() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        let result = channel
            .exchange_declare(&ExchangeDefinition::new("X").fanout())
            .await;

        assert!(matches!(result, Err(AmqpError::DeclareExchangeError(_))));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_messages() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let mut deliveries = channel.basic_consume("Q", false).await.unwrap();
        channel
            .basic_publish("X", "rk.a", b"1", MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();

        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("Q"), 1);
        assert!(deliveries.next().await.is_none());
        assert!(channel.basic_qos(1).await.is_err());
    }

    #[tokio::test]
    async fn dropping_channels_closes_every_channel() {
        let broker = InMemoryBroker::new();
        let first = channel(&broker).await;
        let second = channel(&broker).await;
        let mut deliveries = first.basic_consume("Q", false).await.unwrap();
        second
            .basic_publish("X", "rk.a", b"1", MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        assert_eq!(broker.drop_channels(), 2);

        assert!(!first.is_open() && !second.is_open());
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("Q"), 1);
        assert!(broker.has_exchange("X"));
    }
}
