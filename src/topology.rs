// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Setup
//!
//! `AmqpTopology` is the setup pipeline run on a channel before it carries
//! traffic: an ordered list of exchange, queue, binding and prefetch steps.
//! The connection manager installs it every time it (re)opens a channel.
//!
//! Steps run in the order they were added. The first failing step aborts the
//! rest of the pipeline and its error is returned to whoever triggered the
//! install. Every step is an idempotent broker assertion, so installing the
//! same pipeline twice succeeds.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq)]
enum SetupStep {
    AssertExchange(ExchangeDefinition),
    AssertQueue(QueueDefinition),
    BindQueue(QueueBinding),
    Prefetch(u16),
}

/// Ordered, composable setup pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    steps: Vec<SetupStep>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Asserts a durable topic exchange.
    pub fn assert_exchange(self, name: &str) -> Self {
        self.assert_exchange_with(ExchangeDefinition::new(name))
    }

    /// Asserts an exchange with a custom definition.
    pub fn assert_exchange_with(mut self, def: ExchangeDefinition) -> Self {
        self.steps.push(SetupStep::AssertExchange(def));
        self
    }

    /// Asserts a durable queue.
    pub fn assert_queue(self, name: &str) -> Self {
        self.assert_queue_with(QueueDefinition::new(name))
    }

    /// Asserts a queue with a custom definition.
    pub fn assert_queue_with(mut self, def: QueueDefinition) -> Self {
        self.steps.push(SetupStep::AssertQueue(def));
        self
    }

    /// Binds `queue` to `exchange` with `routing_key`.
    pub fn bind_queue(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        self.steps.push(SetupStep::BindQueue(
            QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(routing_key),
        ));
        self
    }

    /// Limits the number of unacknowledged deliveries per consumer.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.steps.push(SetupStep::Prefetch(count));
        self
    }

    /// Appends every step of `other` after the steps of `self`.
    pub fn then(mut self, other: AmqpTopology) -> Self {
        self.steps.extend(other.steps);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Installs the topology on `channel`.
    ///
    /// # Returns
    /// Ok(()) when every step succeeded, otherwise the error of the first failing step
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for step in &self.steps {
            install_step(channel, step).await?;
        }

        debug!(steps = self.steps.len(), "topology installed");

        Ok(())
    }
}

async fn install_step(channel: &dyn AmqpChannel, step: &SetupStep) -> Result<(), AmqpError> {
    match step {
        SetupStep::AssertExchange(def) => {
            debug!("creating exchange: {}", def.name);
            channel.exchange_declare(def).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                )
            })
        }
        SetupStep::AssertQueue(def) => {
            debug!("creating queue: {}", def.name);
            channel.queue_declare(def).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                )
            })
        }
        SetupStep::BindQueue(binding) => {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.queue_bind(binding).await.inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange")
            })
        }
        SetupStep::Prefetch(count) => {
            debug!("setting prefetch: {}", count);
            channel
                .basic_qos(*count)
                .await
                .inspect_err(|err| error!(error = err.to_string(), "error to configure qos"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::{predicate::eq, Sequence};

    fn pipeline() -> AmqpTopology {
        AmqpTopology::new()
            .assert_exchange("X")
            .assert_queue("Q")
            .bind_queue("Q", "X", "rk")
    }

    #[tokio::test]
    async fn installs_steps_in_order_and_is_repeatable() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        for _ in 0..2 {
            channel
                .expect_exchange_declare()
                .withf(|def| def.name == "X" && def.durable)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            channel
                .expect_queue_declare()
                .withf(|def| def.name == "Q" && def.durable)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            channel
                .expect_queue_bind()
                .withf(|b| b.queue_name == "Q" && b.exchange_name == "X" && b.routing_key == "rk")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let topology = pipeline();

        assert!(topology.install(&channel).await.is_ok());
        assert!(topology.install(&channel).await.is_ok());
    }

    #[tokio::test]
    async fn failure_aborts_the_remaining_steps() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("X".to_owned())));
        channel.expect_queue_declare().times(0);
        channel.expect_queue_bind().times(0);

        let result = pipeline().install(&channel).await;

        assert_eq!(result, Err(AmqpError::DeclareExchangeError("X".to_owned())));
    }

    #[tokio::test]
    async fn prefetch_and_concatenation() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_basic_qos()
            .with(eq(10))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|def| def.name == "replies" && def.exclusive && !def.durable)
            .times(1)
            .returning(|_| Ok(()));

        let topology = AmqpTopology::new().prefetch(10).then(
            AmqpTopology::new()
                .assert_queue_with(QueueDefinition::new("replies").transient().exclusive()),
        );

        assert_eq!(topology.len(), 2);
        assert!(topology.install(&channel).await.is_ok());
    }
}
