// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Contract
//!
//! This module defines the broker-facing seam of the adapter. `AmqpChannel`
//! is the set of channel operations the adapter needs, and `ConnectionManager`
//! is the collaborator that owns the connection, opens confirm-capable
//! channels and re-runs the topology setup whenever a channel is (re)opened.
//! `ChannelFactory` is the lower seam both implementations share: it opens
//! bare channels, and `resilient::ResilientChannel` turns them into one
//! logical channel that survives channel closes.
//!
//! Two implementations ship with the crate: `connection::LapinConnectionManager`
//! for a real RabbitMQ server and `memory::InMemoryBroker` for tests.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Pseudo-queue RabbitMQ provides for direct replies.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// A message header (or declaration argument) value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
}

impl HeaderValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// The AMQP basic properties the adapter reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub expiration: Option<String>,
    pub persistent: bool,
    pub headers: Headers,
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Channel operations used by the adapter.
///
/// `basic_publish` resolves only once the broker confirmed the message when
/// the channel runs in confirm mode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// False once the broker or the caller closed the channel.
    fn is_open(&self) -> bool;
}

/// Opens bare channels on a live connection. Used by
/// `resilient::ResilientChannel` every time it has to replace a closed
/// channel.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Owner of the broker connection.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Opens a channel and installs `setup` on it. The same setup runs again
    /// every time the manager has to reopen the channel.
    async fn create_channel(
        &self,
        setup: Arc<AmqpTopology>,
        confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn wait_for_connect(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError>;
}
