// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module serializes payloads to JSON and publishes them on the adapter
//! channel. Every message is stamped with the JSON content type and a fresh
//! message id unless the caller supplies one, and carries the current
//! OpenTelemetry context in its headers. A publish resolves once the broker
//! confirmed it; there is no retry.

use crate::{
    channel::{AmqpChannel, HeaderValue, Headers, MessageProperties},
    errors::AmqpError,
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug_span, error, trace, Instrument};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Caller-supplied publish properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub expiration: Option<String>,
    pub persistent: bool,
    pub headers: Headers,
}

impl PublishOptions {
    pub fn new() -> Self {
        PublishOptions::default()
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn with_expiration(mut self, ms: u64) -> Self {
        self.expiration = Some(ms.to_string());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// JSON publisher bound to a channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }

    /// Publishes `payload` to `exchange` with `routing_key`.
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the message, or AmqpError on failure
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
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let mut headers = options.headers;
        otel::inject_context(&Context::current(), &mut headers);

        let properties = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            message_id: Some(
                options
                    .message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            kind: options.kind,
            expiration: options.expiration,
            persistent: options.persistent,
            headers,
        };

        async {
            trace!(bytes = data.len(), "publishing message");

            self.channel
                .basic_publish(exchange, routing_key, &data, properties)
                .await
                .inspect_err(|err| error!(error = err.to_string(), "error publishing message"))
        }
        .instrument(debug_span!("publish", exchange, routing_key))
        .await
    }
}
