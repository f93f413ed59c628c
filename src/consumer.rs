// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module turns raw deliveries into typed handler invocations and
//! settles them with the broker:
//!
//! - event deliveries are acked when the handler succeeds and nacked when it
//!   fails (or the payload cannot be parsed);
//! - RPC deliveries additionally publish a reply envelope to the requester
//!   before being settled.
//!
//! A failed delivery is requeued once. If it was already redelivered it is
//! dropped, so a poison message cannot loop forever.

use crate::{
    channel::{AmqpChannel, Delivery},
    errors::{AmqpError, ApplicationError},
    otel,
    protocol::{ReplyEnvelope, RPC_ERROR_HEADER},
    publisher::{PublishOptions, RabbitMQPublisher},
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{borrow::Cow, future::Future};
use tracing::{debug, error, trace, warn};

/// Code of the error reply sent when an RPC request body cannot be parsed.
pub const INVALID_PAYLOAD_ERROR_CODE: &str = "invalid_payload";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles the payload of an event delivery.
#[async_trait]
pub trait EventHandler<P>: Send + Sync {
    async fn handle(&self, payload: P, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<P, F, Fut> EventHandler<P> for F
where
    P: Send + 'static,
    F: Fn(P, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: P, delivery: &Delivery) -> Result<(), HandlerError> {
        self(payload, delivery.clone()).await
    }
}

/// Handles the payload of an RPC delivery and produces the reply.
#[async_trait]
pub trait RpcHandler<P, R>: Send + Sync {
    async fn handle(&self, payload: P, delivery: &Delivery) -> Result<R, ApplicationError>;
}

#[async_trait]
impl<P, R, F, Fut> RpcHandler<P, R> for F
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ApplicationError>> + Send + 'static,
{
    async fn handle(&self, payload: P, delivery: &Delivery) -> Result<R, ApplicationError> {
        self(payload, delivery.clone()).await
    }
}

/// Processes one event delivery.
///
/// # Returns
/// Ok(()) once the delivery was settled, or AmqpError when the ack/nack failed
pub(crate) async fn consume_event<P, H>(
    channel: &dyn AmqpChannel,
    handler: &H,
    delivery: Delivery,
) -> Result<(), AmqpError>
where
    P: DeserializeOwned + Send,
    H: EventHandler<P> + ?Sized,
{
    let (_ctx, mut span) = otel::new_span(
        &delivery.properties,
        &global::tracer(otel::TRACER_NAME),
        &delivery.routing_key,
    );

    let outcome = match serde_json::from_slice::<P>(&delivery.data) {
        Ok(payload) => {
            trace!(routing_key = delivery.routing_key.as_str(), "received message");
            handler
                .handle(payload, &delivery)
                .await
                .map_err(|err| err.to_string())
        }
        Err(err) => Err(AmqpError::ParsePayloadError(err.to_string()).to_string()),
    };

    match outcome {
        Ok(()) => {
            debug!("message successfully processed");
            ack(channel, &delivery, &mut span).await
        }
        Err(reason) => {
            warn!(
                error = reason.as_str(),
                redelivered = delivery.redelivered,
                "error whiling handling msg"
            );
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });
            nack(channel, &delivery, !delivery.redelivered, &mut span).await
        }
    }
}

/// Processes one RPC delivery: runs the handler, publishes the reply to the
/// requester and settles the delivery.
///
/// # Returns
/// Ok(()) once the delivery was settled, or AmqpError when the ack/nack failed
pub(crate) async fn consume_rpc<P, R, H>(
    channel: &dyn AmqpChannel,
    publisher: &RabbitMQPublisher,
    handler: &H,
    delivery: Delivery,
) -> Result<(), AmqpError>
where
    P: DeserializeOwned + Send,
    R: Serialize + Send + Sync,
    H: RpcHandler<P, R> + ?Sized,
{
    let (_ctx, mut span) = otel::new_span(
        &delivery.properties,
        &global::tracer(otel::TRACER_NAME),
        &delivery.routing_key,
    );

    let result = match serde_json::from_slice::<P>(&delivery.data) {
        Ok(payload) => {
            trace!(routing_key = delivery.routing_key.as_str(), "received request");
            handler.handle(payload, &delivery).await
        }
        Err(err) => Err(ApplicationError::new(
            INVALID_PAYLOAD_ERROR_CODE,
            err.to_string(),
        )),
    };

    if let Err(err) = &result {
        warn!(
            code = err.code.as_str(),
            error = err.message.as_str(),
            "rpc handler failed"
        );
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }
    let handled = result.is_ok();

    match reply(publisher, &delivery, result).await {
        Ok(()) if handled => ack(channel, &delivery, &mut span).await,
        Ok(()) => nack(channel, &delivery, !delivery.redelivered, &mut span).await,
        Err(err) => {
            error!(error = err.to_string(), "error whiling replying");
            span.record_error(&err);
            let requeue = err != AmqpError::MissingReplyTo && !delivery.redelivered;
            nack(channel, &delivery, requeue, &mut span).await
        }
    }
}

async fn reply<R>(
    publisher: &RabbitMQPublisher,
    delivery: &Delivery,
    result: Result<R, ApplicationError>,
) -> Result<(), AmqpError>
where
    R: Serialize + Send + Sync,
{
    let reply_to = delivery
        .properties
        .reply_to
        .as_deref()
        .ok_or(AmqpError::MissingReplyTo)?;

    let mut options = PublishOptions::new();
    if let Some(correlation_id) = &delivery.properties.correlation_id {
        options = options.with_correlation_id(correlation_id);
    }
    if result.is_err() {
        options = options.with_header(RPC_ERROR_HEADER, true);
    }

    let envelope = ReplyEnvelope::from(result);

    publisher.publish("", reply_to, &envelope, options).await
}

async fn ack(
    channel: &dyn AmqpChannel,
    delivery: &Delivery,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    match channel.basic_ack(delivery.delivery_tag).await {
        Err(e) => {
            error!("error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(AmqpError::AckMessageError)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

async fn nack(
    channel: &dyn AmqpChannel,
    delivery: &Delivery,
    requeue: bool,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    debug!(requeue, "nacking message");

    match channel
        .basic_nack(delivery.delivery_tag, false, requeue)
        .await
    {
        Err(e) => {
            error!("error whiling nack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            Err(AmqpError::NackMessageError)
        }
        _ => Ok(()),
    }
}
