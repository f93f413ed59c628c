// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module owns the consume loops of the adapter. Each registered queue
//! gets a consumer on the shared channel and a spawned task that feeds every
//! delivery to a callback. A failing delivery is logged and the loop keeps
//! going; the loop only ends when the broker closes the consumer or the
//! dispatcher is shut down.

use crate::{
    channel::{AmqpChannel, Delivery},
    errors::AmqpError,
};
use futures_util::StreamExt;
use std::{future::Future, sync::Arc, sync::Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Self {
        RabbitMQDispatcher {
            channel,
            consumers: Mutex::new(vec![]),
        }
    }

    /// Starts consuming `queue`, calling `on_delivery` for each message.
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the consumer, or AmqpError when it
    /// rejected it
    pub async fn spawn<F, Fut>(
        &self,
        queue: &str,
        no_ack: bool,
        on_delivery: F,
    ) -> Result<(), AmqpError>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        let mut deliveries = self
            .channel
            .basic_consume(queue, no_ack)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    queue, "error to create the consumer"
                )
            })?;

        let handle = tokio::spawn(
            async move {
                while let Some(result) = deliveries.next().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = on_delivery(delivery).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                info!("consumer stopped");
            }
            .instrument(info_span!("consumer", queue)),
        );

        self.consumers
            .lock()
            .map_err(|_| AmqpError::InternalError)?
            .push(handle);

        info!(queue, "registered consumer");

        Ok(())
    }

    pub fn running(&self) -> usize {
        self.consumers
            .lock()
            .map(|consumers| consumers.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or_default()
    }

    /// Stops every consume loop.
    pub fn shutdown(&self) {
        if let Ok(mut consumers) = self.consumers.lock() {
            for handle in consumers.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for RabbitMQDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageProperties, MockAmqpChannel};
    use futures_util::stream;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: "q".to_owned(),
            redelivered: false,
            properties: MessageProperties::default(),
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn keeps_consuming_after_a_failed_delivery() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_consume()
            .withf(|queue, no_ack| queue == "q" && !*no_ack)
            .times(1)
            .returning(|_, _| {
                Ok(stream::iter(vec![
                    Ok(delivery(1)),
                    Err(AmqpError::ConsumerError("glitch".to_owned())),
                    Ok(delivery(2)),
                    Ok(delivery(3)),
                ])
                .boxed())
            });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = RabbitMQDispatcher::new(Arc::new(channel));

        dispatcher
            .spawn("q", false, move |delivery| {
                let tx = tx.clone();
                async move {
                    tx.send(delivery.delivery_tag).unwrap();
                    if delivery.delivery_tag == 2 {
                        return Err(AmqpError::NackMessageError);
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        let mut seen = vec![];
        while let Ok(Some(tag)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            seen.push(tag);
        }

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn consumer_registration_failures_are_returned() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_consume()
            .returning(|_, _| Err(AmqpError::ConsumerDeclarationError("q".to_owned())));

        let dispatcher = RabbitMQDispatcher::new(Arc::new(channel));

        let result = dispatcher
            .spawn("q", false, |_| async { Ok::<(), AmqpError>(()) })
            .await;

        assert_eq!(
            result,
            Err(AmqpError::ConsumerDeclarationError("q".to_owned()))
        );
        assert_eq!(dispatcher.running(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loops() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_consume()
            .returning(|_, _| Ok(stream::pending().boxed()));

        let dispatcher = RabbitMQDispatcher::new(Arc::new(channel));
        dispatcher
            .spawn("q", false, |_| async { Ok::<(), AmqpError>(()) })
            .await
            .unwrap();
        assert_eq!(dispatcher.running(), 1);

        dispatcher.shutdown();

        assert_eq!(dispatcher.running(), 0);
    }
}
