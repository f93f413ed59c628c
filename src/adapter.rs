// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Adapter
//!
//! The adapter is the entry point of the crate. It opens one confirm-mode
//! channel with the caller's topology as setup, starts the single consumer on
//! the direct reply-to queue that feeds the correlation registry, and exposes
//! publish, event and RPC consumers, request/reply and close on top of that
//! channel.
//!
//! ```no_run
//! use rabbitmq_adapter::{AmqpConfigs, AmqpTopology, RabbitMQAdapter};
//!
//! # async fn run() -> Result<(), rabbitmq_adapter::AmqpError> {
//! let topology = AmqpTopology::new()
//!     .assert_exchange("accounts")
//!     .assert_queue("accounts.rpc")
//!     .bind_queue("accounts.rpc", "accounts", "user.get");
//!
//! let adapter = RabbitMQAdapter::connect(&AmqpConfigs::from_env()?, topology).await?;
//! let _user: serde_json::Value = adapter
//!     .request("accounts", "user.get", &serde_json::json!({"id": 42}), None, Default::default())
//!     .await?;
//! adapter.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::{AmqpChannel, ConnectionManager, DIRECT_REPLY_QUEUE},
    config::AmqpConfigs,
    connection::LapinConnectionManager,
    consumer::{self, EventHandler, RpcHandler},
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    publisher::{PublishOptions, RabbitMQPublisher},
    request::{CorrelationRegistry, Requester},
    topology::AmqpTopology,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Handle over one broker connection.
pub struct RabbitMQAdapter {
    connection: Arc<dyn ConnectionManager>,
    channel: Arc<dyn AmqpChannel>,
    publisher: Arc<RabbitMQPublisher>,
    dispatcher: RabbitMQDispatcher,
    registry: Arc<CorrelationRegistry>,
    requester: Requester,
}

impl RabbitMQAdapter {
    /// Connects to RabbitMQ with `lapin` and builds the adapter.
    ///
    /// When the configuration sets a prefetch it is applied before the rest
    /// of the topology.
    pub async fn connect(cfg: &AmqpConfigs, topology: AmqpTopology) -> Result<Self, AmqpError> {
        let connection = LapinConnectionManager::connect(cfg).await?;

        Self::with_connection(
            Arc::new(connection),
            startup_topology(cfg, topology),
            cfg.request_timeout(),
        )
        .await
    }

    /// Builds the adapter on an existing connection manager.
    ///
    /// # Parameters
    /// * `connection` - Owner of the broker connection
    /// * `topology` - Setup installed on the channel on every (re)connect
    /// * `request_timeout` - Timeout of requests that do not set their own
    ///
    /// # Returns
    /// The adapter once the topology is installed and the reply consumer
    /// runs, or the AmqpError that prevented it
    pub async fn with_connection(
        connection: Arc<dyn ConnectionManager>,
        topology: AmqpTopology,
        request_timeout: Duration,
    ) -> Result<Self, AmqpError> {
        let channel = connection.create_channel(Arc::new(topology), true).await?;
        connection.wait_for_connect().await?;

        let publisher = RabbitMQPublisher::new(channel.clone());
        let registry = Arc::new(CorrelationRegistry::new());
        let dispatcher = RabbitMQDispatcher::new(channel.clone());

        let replies = registry.clone();
        dispatcher
            .spawn(DIRECT_REPLY_QUEUE, true, move |delivery| {
                replies.dispatch(delivery);
                future::ready(Ok(()))
            })
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), "failed to start rpc consumer")
            })?;
        info!("started rpc consumer");

        let requester = Requester::new(registry.clone(), publisher.clone(), request_timeout);

        Ok(RabbitMQAdapter {
            connection,
            channel,
            publisher,
            dispatcher,
            registry,
            requester,
        })
    }

    /// Publishes `payload` as JSON.
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the message
    pub async fn publish<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        P: Serialize + Sync + ?Sized,
    {
        self.publisher
            .publish(exchange, routing_key, payload, options)
            .await
    }

    /// Subscribes `handler` to the events of `queue`.
    ///
    /// A delivery is acked when the handler succeeds. On failure it is
    /// requeued once, then dropped.
    ///
    /// # Returns
    /// Ok(()) once the consumer is registered, or AmqpError when the broker
    /// rejected it
    pub async fn consume_event<P, H>(&self, queue: &str, handler: H) -> Result<(), AmqpError>
    where
        P: DeserializeOwned + Send + 'static,
        H: EventHandler<P> + 'static,
    {
        let channel = self.channel.clone();
        let handler = Arc::new(handler);

        self.dispatcher
            .spawn(queue, false, move |delivery| {
                let channel = channel.clone();
                let handler = handler.clone();
                async move {
                    consumer::consume_event::<P, H>(channel.as_ref(), handler.as_ref(), delivery)
                        .await
                }
            })
            .await?;

        info!(queue, "registered event handler");
        Ok(())
    }

    /// Subscribes `handler` to the requests of `queue`. Every request gets a
    /// reply, including the application errors returned by the handler.
    ///
    /// # Returns
    /// Ok(()) once the consumer is registered, or AmqpError when the broker
    /// rejected it
    pub async fn consume_rpc<P, R, H>(&self, queue: &str, handler: H) -> Result<(), AmqpError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + Sync + 'static,
        H: RpcHandler<P, R> + 'static,
    {
        let channel = self.channel.clone();
        let publisher = self.publisher.clone();
        let handler = Arc::new(handler);

        self.dispatcher
            .spawn(queue, false, move |delivery| {
                let channel = channel.clone();
                let publisher = publisher.clone();
                let handler = handler.clone();
                async move {
                    consumer::consume_rpc::<P, R, H>(
                        channel.as_ref(),
                        &publisher,
                        handler.as_ref(),
                        delivery,
                    )
                    .await
                }
            })
            .await?;

        info!(queue, "registered rpc handler");
        Ok(())
    }

    /// Sends a request and waits for its reply.
    ///
    /// # Parameters
    /// * `timeout` - How long to wait; the configured request timeout when None
    ///
    /// # Returns
    /// The reply payload, `AmqpError::Application` with the handler's error,
    /// `AmqpError::Timeout` when no reply arrived in time, or the transport
    /// error that prevented the request
    pub async fn request<P, R>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
        timeout: Option<Duration>,
        options: PublishOptions,
    ) -> Result<R, AmqpError>
    where
        P: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.requester
            .request(exchange, routing_key, payload, timeout, options)
            .await
    }

    /// Number of requests still waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }

    /// Stops the consumers, fails the pending requests with
    /// `AmqpError::ReplyChannelClosed`, then closes the channel and the
    /// connection, in that order. The connection is closed even when closing
    /// the channel failed; the first error is returned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing rabbitmq adapter...");
        self.dispatcher.shutdown();

        let abandoned = self.registry.abandon_all();
        if abandoned > 0 {
            warn!(abandoned, "closing with pending requests");
        }

        let channel_closed = self.channel.close().await;
        let connection_closed = self.connection.close().await;

        channel_closed.and(connection_closed)?;
        info!("rabbitmq adapter closed");
        Ok(())
    }
}

fn startup_topology(cfg: &AmqpConfigs, topology: AmqpTopology) -> AmqpTopology {
    match cfg.prefetch {
        Some(count) => AmqpTopology::new().prefetch(count).then(topology),
        None => topology,
    }
}
