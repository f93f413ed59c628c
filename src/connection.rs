// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Connection Manager
//!
//! This module implements the channel contract on top of `lapin`. It
//! establishes the connection to RabbitMQ and opens confirm-mode channels.
//! Each channel handed to the adapter is a `ResilientChannel`, which installs
//! the topology and replaces the `lapin` channel when the broker closes it.

use crate::{
    channel::{
        AmqpChannel, ChannelFactory, ConnectionManager, Delivery, DeliveryStream, HeaderValue,
        Headers, MessageProperties,
    },
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    resilient::ResilientChannel,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connection manager backed by a single `lapin` connection.
pub struct LapinConnectionManager {
    connection: Arc<Connection>,
}

impl LapinConnectionManager {
    /// Connects to the RabbitMQ server described by `cfg`.
    ///
    /// Connection errors reported after this point are only logged.
    ///
    /// # Returns
    /// The connection manager, or `AmqpError::ConnectionError` on failure
    pub async fn connect(cfg: &AmqpConfigs) -> Result<Self, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let conn = match Connection::connect_uri(cfg.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        conn.on_error(|err| {
            error!(
                error = err.to_string(),
                "an error occurred on the rabbitmq connection"
            )
        });
        info!("connected to rabbitmq");

        Ok(LapinConnectionManager {
            connection: Arc::new(conn),
        })
    }
}

#[async_trait]
impl ConnectionManager for LapinConnectionManager {
    async fn create_channel(
        &self,
        setup: Arc<AmqpTopology>,
        confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let factory = LapinChannelFactory {
            connection: self.connection.clone(),
        };
        let channel = ResilientChannel::open(Arc::new(factory), setup, confirm).await?;

        Ok(Arc::new(channel))
    }

    async fn wait_for_connect(&self) -> Result<(), AmqpError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(AmqpError::ConnectionError("not connected".to_owned()))
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connection...");
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::CloseError(err.to_string())
            })
    }
}

struct LapinChannelFactory {
    connection: Arc<Connection>,
}

#[async_trait]
impl ChannelFactory for LapinChannelFactory {
    async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(err.to_string())
                })?;
        }

        debug!(channel_id = channel.id(), "channel created");
        Ok(Arc::new(OpenChannel(channel)))
    }
}

struct OpenChannel(Channel);

#[async_trait]
impl AmqpChannel for OpenChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.0
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.params),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(format!("{}: {}", def.name, err)))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.0
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                field_table(&def.arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(format!("{}: {}", def.name, err)))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.0
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|_| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.0
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNotConfirmed);
        }

        Ok(())
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.0
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.0
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp channel...");
        self.0.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the channel");
            AmqpError::CloseError(err.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }
}

fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        data: delivery.data,
    }
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match header_value(value) {
                    Some(v) => Some((key.to_string(), v)),
                    None => {
                        debug!(
                            header = key.as_str(),
                            kind = ?value.get_type(),
                            "skipping header of unsupported type"
                        );
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: props.content_type().as_ref().map(ToString::to_string),
        message_id: props.message_id().as_ref().map(ToString::to_string),
        correlation_id: props.correlation_id().as_ref().map(ToString::to_string),
        reply_to: props.reply_to().as_ref().map(ToString::to_string),
        kind: props.kind().as_ref().map(ToString::to_string),
        expiration: props.expiration().as_ref().map(ToString::to_string),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

fn basic_properties(props: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(field_table(&props.headers));

    if let Some(content_type) = props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(message_id) = props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id));
    }
    if let Some(correlation_id) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(kind) = props.kind {
        basic = basic.with_type(ShortString::from(kind));
    }
    if let Some(expiration) = props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration));
    }
    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    basic
}

fn field_table(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(btree)
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(i) => i32::try_from(*i)
            .map(AMQPValue::LongInt)
            .unwrap_or(AMQPValue::LongLongInt(*i)),
        HeaderValue::Float(f) => AMQPValue::Double(*f),
        HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
    }
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::ShortShortUInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::ShortInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::ShortUInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::LongInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::LongUInt(i) => Some(HeaderValue::Int((*i).into())),
        AMQPValue::LongLongInt(i) => Some(HeaderValue::Int(*i)),
        AMQPValue::Float(f) => Some(HeaderValue::Float((*f).into())),
        AMQPValue::Double(f) => Some(HeaderValue::Float(*f)),
        AMQPValue::ShortString(s) => Some(HeaderValue::String(s.to_string())),
        AMQPValue::LongString(s) => Some(HeaderValue::String(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        AMQPValue::ByteArray(b) => Some(HeaderValue::Bytes(b.as_slice().to_vec())),
        AMQPValue::Timestamp(t) => Some(HeaderValue::Timestamp(*t)),
        AMQPValue::DecimalValue(_)
        | AMQPValue::FieldArray(_)
        | AMQPValue::FieldTable(_)
        | AMQPValue::Void => None,
    }
}
