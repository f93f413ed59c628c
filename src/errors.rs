// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Adapter
//!
//! This module provides the error taxonomy for every adapter operation.
//! Transport failures (connection, channel, topology, publish, consume) are
//! generic variants of `AmqpError`. Two outcomes of a request are singled out
//! so callers can match on them directly: `AmqpError::Timeout` and
//! `AmqpError::Application`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error produced by an RPC handler and delivered to the requester.
///
/// The `code` is machine readable and the `message` is meant for humans. Both
/// survive the trip through the reply envelope unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("application error `{code}`: {message}")]
pub struct ApplicationError {
    pub code: String,
    pub message: String,
}

impl ApplicationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApplicationError {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Represents errors that can occur during adapter operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Configuration could not be loaded or is malformed
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmed,

    /// Error serializing a payload to JSON
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// An RPC request arrived without a reply address
    #[error("rpc request has no reply-to address")]
    MissingReplyTo,

    /// The reply waiter was dropped before any reply arrived
    #[error("reply channel closed before a reply was received")]
    ReplyChannelClosed,

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// No reply was received within the request timeout
    #[error("failed to receive response within timeout of {0}ms")]
    Timeout(u64),

    /// The RPC handler replied with an application error
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl AmqpError {
    /// Returns true when the request timed out waiting for its reply.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AmqpError::Timeout(_))
    }

    /// Returns the application error carried by an RPC error reply, if any.
    pub fn application_error(&self) -> Option<&ApplicationError> {
        match self {
            AmqpError::Application(err) => Some(err),
            _ => None,
        }
    }
}
