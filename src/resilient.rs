// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Channel
//!
//! One logical channel over a succession of bare channels. RabbitMQ closes a
//! channel on any channel-level exception: a publish to a missing exchange,
//! an ack with an unknown tag, an inequivalent declare. When that happens the
//! next operation, or the end of any consumer stream, opens a replacement,
//! installs the topology on it and subscribes every registered consumer
//! again. The delivery stream returned by `basic_consume` keeps flowing
//! across replacements.
//!
//! Every replacement is a new generation. Delivery tags handed out by this
//! channel carry their generation in the upper 16 bits, so an ack or nack for
//! a delivery of a closed channel is dropped rather than sent to its
//! successor, where the tag means nothing. The broker requeues those
//! deliveries on its own.

use crate::{
    channel::{AmqpChannel, ChannelFactory, Delivery, DeliveryStream, MessageProperties},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, debug_span, error, info, warn, Instrument};

const GENERATION_SHIFT: u32 = 48;
const TAG_MASK: u64 = (1 << GENERATION_SHIFT) - 1;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

struct Subscription {
    queue: String,
    no_ack: bool,
    deliveries: DeliverySender,
}

struct Generation {
    id: u64,
    channel: Arc<dyn AmqpChannel>,
}

#[derive(Default)]
struct State {
    current: Option<Generation>,
    last_generation: u64,
    subscriptions: Vec<Subscription>,
}

struct Shared {
    factory: Arc<dyn ChannelFactory>,
    setup: Arc<AmqpTopology>,
    confirm: bool,
    closed: AtomicBool,
    state: Mutex<State>,
}

/// A channel that replaces itself when the broker closes it.
pub struct ResilientChannel {
    shared: Arc<Shared>,
}

impl ResilientChannel {
    /// Opens the first channel from `factory` and installs `setup` on it.
    pub async fn open(
        factory: Arc<dyn ChannelFactory>,
        setup: Arc<AmqpTopology>,
        confirm: bool,
    ) -> Result<Self, AmqpError> {
        let shared = Arc::new(Shared {
            factory,
            setup,
            confirm,
            closed: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        });

        {
            let mut state = shared.state.lock().await;
            ensure_open(&shared, &mut state).await?;
        }

        Ok(ResilientChannel { shared })
    }

    /// Generation of the channel in use. The first channel is generation 1.
    pub async fn generation(&self) -> u64 {
        let state = self.shared.state.lock().await;
        state.current.as_ref().map(|g| g.id).unwrap_or_default()
    }

    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.shared.state.lock().await;
        ensure_open(&self.shared, &mut state)
            .await
            .map(|(_, channel)| channel)
    }

    /// The channel a delivery tag can still be settled on, with the tag the
    /// broker knows, or None when the delivery came from a closed channel.
    async fn settling_channel(&self, delivery_tag: u64) -> Option<(Arc<dyn AmqpChannel>, u64)> {
        let (generation, tag) = split_tag(delivery_tag);
        let state = self.shared.state.lock().await;

        match state.current.as_ref() {
            Some(current) if current.id == generation && current.channel.is_open() => {
                Some((current.channel.clone(), tag))
            }
            _ => {
                debug!(
                    generation,
                    delivery_tag = tag,
                    "dropping settlement of a delivery from a closed channel"
                );
                None
            }
        }
    }
}

async fn ensure_open(
    shared: &Arc<Shared>,
    state: &mut State,
) -> Result<(u64, Arc<dyn AmqpChannel>), AmqpError> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(AmqpError::ChannelError("channel closed".to_owned()));
    }

    if let Some(current) = state.current.as_ref() {
        if current.channel.is_open() {
            return Ok((current.id, current.channel.clone()));
        }
        warn!(
            generation = current.id,
            "amqp channel is no longer open, reopening"
        );
    }

    state.last_generation += 1;
    let generation = state.last_generation;

    debug!(generation, "creating amqp channel...");
    let channel = shared.factory.open_channel(shared.confirm).await?;

    if let Err(err) = prepare(shared, generation, channel.as_ref(), state).await {
        if channel.is_open() {
            channel.close().await.ok();
        }
        return Err(err);
    }
    if generation > 1 {
        info!(
            generation,
            consumers = state.subscriptions.len(),
            "amqp channel reopened"
        );
    }

    state.current = Some(Generation {
        id: generation,
        channel: channel.clone(),
    });
    Ok((generation, channel))
}

/// Installs the topology on a new channel and subscribes the registered
/// consumers on it.
async fn prepare(
    shared: &Arc<Shared>,
    generation: u64,
    channel: &dyn AmqpChannel,
    state: &mut State,
) -> Result<(), AmqpError> {
    shared.setup.install(channel).await?;

    state.subscriptions.retain(|s| !s.deliveries.is_closed());
    for subscription in &state.subscriptions {
        let deliveries = channel
            .basic_consume(&subscription.queue, subscription.no_ack)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = subscription.queue.as_str(),
                    "failed to resubscribe consumer"
                )
            })?;
        forward(shared, generation, deliveries, subscription.deliveries.clone());
    }

    Ok(())
}

/// Pipes the deliveries of one bare consumer into the caller's stream. When
/// the bare consumer ends while its channel is still the current one, the
/// channel is replaced so the other consumers come back too.
fn forward(
    shared: &Arc<Shared>,
    generation: u64,
    mut deliveries: DeliveryStream,
    sender: DeliverySender,
) {
    let shared = Arc::downgrade(shared);

    tokio::spawn(
        async move {
            while let Some(result) = deliveries.next().await {
                let result = result.map(|mut delivery| {
                    delivery.delivery_tag = tag_with_generation(generation, delivery.delivery_tag);
                    delivery
                });
                if sender.send(result).is_err() {
                    return;
                }
            }

            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }

            let mut state = shared.state.lock().await;
            if state.current.as_ref().map(|g| g.id) != Some(generation) {
                return;
            }
            debug!("consumer ended with its channel");
            if let Err(err) = ensure_open(&shared, &mut state).await {
                error!(error = err.to_string(), "failed to reopen amqp channel");
            }
        }
        .instrument(debug_span!("forward", generation)),
    );
}

fn tag_with_generation(generation: u64, delivery_tag: u64) -> u64 {
    (generation << GENERATION_SHIFT) | (delivery_tag & TAG_MASK)
}

fn split_tag(delivery_tag: u64) -> (u64, u64) {
    (delivery_tag >> GENERATION_SHIFT, delivery_tag & TAG_MASK)
}

#[async_trait]
impl AmqpChannel for ResilientChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel().await?.exchange_declare(def).await
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel().await?.queue_declare(def).await
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel().await?.queue_bind(binding).await
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel().await?.basic_qos(prefetch).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.channel()
            .await?
            .basic_publish(exchange, routing_key, payload, properties)
            .await
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.shared.state.lock().await;
        let (generation, channel) = ensure_open(&self.shared, &mut state).await?;
        let deliveries = channel.basic_consume(queue, no_ack).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        forward(&self.shared, generation, deliveries, sender.clone());
        state.subscriptions.push(Subscription {
            queue: queue.to_owned(),
            no_ack,
            deliveries: sender,
        });

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self.settling_channel(delivery_tag).await {
            Some((channel, tag)) => channel.basic_ack(tag).await,
            None => Ok(()),
        }
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        match self.settling_channel(delivery_tag).await {
            Some((channel, tag)) => channel.basic_nack(tag, multiple, requeue).await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.shared.state.lock().await;
        self.shared.closed.store(true, Ordering::SeqCst);
        state.subscriptions.clear();

        match state.current.take() {
            Some(current) if current.channel.is_open() => current.channel.close().await,
            _ => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use std::time::Duration;

    async fn channel(broker: &InMemoryBroker) -> ResilientChannel {
        let setup = AmqpTopology::new()
            .assert_exchange("X")
            .assert_queue("Q")
            .bind_queue("Q", "X", "rk");

        ResilientChannel::open(Arc::new(broker.clone()), Arc::new(setup), true)
            .await
            .unwrap()
    }

    async fn publish(channel: &ResilientChannel, data: &[u8]) {
        channel
            .basic_publish("X", "rk", data, MessageProperties::default())
            .await
            .unwrap();
    }

    async fn next(deliveries: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn tags_carry_their_generation() {
        let tag = tag_with_generation(3, 17);

        assert_eq!(split_tag(tag), (3, 17));
        assert_ne!(tag, 17);
    }

    #[tokio::test]
    async fn a_broker_error_replaces_the_channel() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        assert_eq!(channel.generation().await, 1);

        let result = channel
            .basic_publish("missing", "rk", b"{}", MessageProperties::default())
            .await;
        assert!(matches!(result, Err(AmqpError::PublishingError(_))));

        publish(&channel, b"1").await;
        assert_eq!(channel.generation().await, 2);
        assert_eq!(broker.queue_depth("Q"), 1);
    }

    #[tokio::test]
    async fn consumers_survive_a_channel_replacement() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let mut deliveries = channel.basic_consume("Q", false).await.unwrap();

        publish(&channel, b"1").await;
        let first = next(&mut deliveries).await;
        channel.basic_ack(first.delivery_tag).await.unwrap();

        broker.drop_channels();
        publish(&channel, b"2").await;

        let second = next(&mut deliveries).await;
        assert_eq!(second.data, b"2");
        channel.basic_ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.acked().len(), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn settlements_from_a_closed_channel_are_dropped() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let mut deliveries = channel.basic_consume("Q", false).await.unwrap();

        publish(&channel, b"1").await;
        let stale = next(&mut deliveries).await;

        broker.drop_channels();

        let redelivered = next(&mut deliveries).await;
        assert!(redelivered.redelivered);
        assert_ne!(redelivered.delivery_tag, stale.delivery_tag);

        assert_eq!(channel.basic_ack(stale.delivery_tag).await, Ok(()));
        assert!(broker.acked().is_empty());
        assert!(channel.is_open());

        channel.basic_ack(redelivered.delivery_tag).await.unwrap();
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn closing_ends_the_streams_for_good() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let mut deliveries = channel.basic_consume("Q", false).await.unwrap();

        channel.close().await.unwrap();

        assert!(!channel.is_open());
        assert!(deliveries.next().await.is_none());
        assert!(channel.basic_qos(1).await.is_err());
    }
}
