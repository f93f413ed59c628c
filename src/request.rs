// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply over Direct Reply-to
//!
//! A request publishes its payload with a fresh correlation id and
//! `reply_to = amq.rabbitmq.reply-to`, then waits for whichever comes first:
//! the reply carrying that correlation id, or the timeout. Replies are routed
//! to their waiter through the `CorrelationRegistry`, which the adapter feeds
//! from its single reply consumer.
//!
//! A waiter is removed as soon as its request settles (reply, timeout or
//! publish failure) or the request future is dropped, so a reply arriving
//! after that is dropped.

use crate::{
    channel::{Delivery, DIRECT_REPLY_QUEUE},
    errors::AmqpError,
    protocol::{decode_reply_envelope, is_rpc_error, ReplyEnvelope},
    publisher::{PublishOptions, RabbitMQPublisher},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, debug_span, error, trace, warn, Instrument};
use uuid::Uuid;

type ReplySender = oneshot::Sender<Delivery>;

/// Pending requests keyed by correlation id.
#[derive(Default)]
pub struct CorrelationRegistry {
    waiters: Mutex<HashMap<String, ReplySender>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        CorrelationRegistry::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, ReplySender>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, correlation_id: &str) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(correlation_id.to_owned(), tx);
        rx
    }

    pub(crate) fn remove(&self, correlation_id: &str) -> bool {
        self.waiters().remove(correlation_id).is_some()
    }

    /// Hands a reply to the request waiting for its correlation id.
    ///
    /// # Returns
    /// false when no request is waiting for it; the reply is dropped
    pub fn dispatch(&self, delivery: Delivery) -> bool {
        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            warn!("dropping reply without correlation id");
            return false;
        };

        let Some(waiter) = self.waiters().remove(&correlation_id) else {
            warn!(
                correlation_id = correlation_id.as_str(),
                "dropping reply for unknown or expired request"
            );
            return false;
        };

        trace!(correlation_id = correlation_id.as_str(), "received reply");

        waiter.send(delivery).is_ok()
    }

    /// Fails every pending request with `AmqpError::ReplyChannelClosed`.
    ///
    /// # Returns
    /// The number of requests that were pending
    pub fn abandon_all(&self) -> usize {
        let mut waiters = self.waiters();
        let pending = waiters.len();
        waiters.clear();
        pending
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a request's waiter when the request settles or its future is
/// dropped.
struct WaiterGuard<'a> {
    registry: &'a CorrelationRegistry,
    correlation_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.registry.remove(self.correlation_id) {
            trace!(correlation_id = self.correlation_id, "waiter released");
        }
    }
}

/// Publishes requests and waits for their replies.
pub struct Requester {
    registry: Arc<CorrelationRegistry>,
    publisher: Arc<RabbitMQPublisher>,
    default_timeout: Duration,
}

impl Requester {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        publisher: Arc<RabbitMQPublisher>,
        default_timeout: Duration,
    ) -> Self {
        Requester {
            registry,
            publisher,
            default_timeout,
        }
    }

    /// Sends `payload` and waits for the reply.
    ///
    /// # Parameters
    /// * `timeout` - How long to wait for the reply; the default timeout when None
    /// * `options` - Extra publish properties. The correlation id and reply
    ///   address are always set by the request
    ///
    /// # Returns
    /// The reply payload, `AmqpError::Application` when the handler replied with
    /// an error, `AmqpError::Timeout` when no reply arrived in time, or the
    /// transport error that prevented the request
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
        let timeout = timeout.unwrap_or(self.default_timeout);
        let correlation_id = Uuid::new_v4().to_string();

        let options = options
            .with_correlation_id(&correlation_id)
            .with_reply_to(DIRECT_REPLY_QUEUE);

        async {
            let waiter = self.registry.register(&correlation_id);
            let _pending = WaiterGuard {
                registry: &self.registry,
                correlation_id: &correlation_id,
            };

            self.publisher
                .publish(exchange, routing_key, payload, options)
                .await?;

            let reply = match tokio::time::timeout(timeout, waiter).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => {
                    debug!("request abandoned");
                    return Err(AmqpError::ReplyChannelClosed);
                }
                Err(_) => {
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    error!(timeout_ms, "request timed out");
                    return Err(AmqpError::Timeout(timeout_ms));
                }
            };

            decode_reply(&reply)
        }
        .instrument(debug_span!(
            "request",
            exchange,
            routing_key,
            correlation_id = correlation_id.as_str()
        ))
        .await
    }
}

/// Decodes a reply body. The body decides between success and failure; a
/// disagreeing `x-is-rpc-error` header is only logged.
pub(crate) fn decode_reply<R>(reply: &Delivery) -> Result<R, AmqpError>
where
    R: DeserializeOwned,
{
    let envelope: ReplyEnvelope<R> = serde_json::from_slice(&reply.data).map_err(|err| {
        error!(error = err.to_string(), "error parsing reply");
        AmqpError::ParsePayloadError(err.to_string())
    })?;

    let flagged = is_rpc_error(&reply.properties);
    if flagged != envelope.is_error() {
        warn!(
            flagged,
            is_error = envelope.is_error(),
            "rpc error header disagrees with reply body"
        );
    }

    decode_reply_envelope(envelope).map_err(AmqpError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{HeaderValue, MessageProperties, MockAmqpChannel},
        errors::ApplicationError,
        protocol::RPC_ERROR_HEADER,
    };
    use serde_json::{json, Value};
    use std::time::Instant;

    fn reply(correlation_id: &str, body: &str, flagged: bool) -> Delivery {
        let mut properties = MessageProperties {
            correlation_id: Some(correlation_id.to_owned()),
            ..MessageProperties::default()
        };
        if flagged {
            properties
                .headers
                .insert(RPC_ERROR_HEADER.to_owned(), HeaderValue::Bool(true));
        }

        Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: DIRECT_REPLY_QUEUE.to_owned(),
            redelivered: false,
            properties,
            data: body.as_bytes().to_vec(),
        }
    }

    /// Builds a requester whose publishes are answered by `answer`.
    fn requester<F>(answer: F) -> (Requester, Arc<CorrelationRegistry>)
    where
        F: Fn(&CorrelationRegistry, MessageProperties) -> Result<(), AmqpError>
            + Send
            + Sync
            + 'static,
    {
        let registry = Arc::new(CorrelationRegistry::new());
        let replies = registry.clone();

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_publish()
            .returning(move |_, _, _, props| answer(&replies, props));

        let requester = Requester::new(
            registry.clone(),
            RabbitMQPublisher::new(Arc::new(channel)),
            Duration::from_millis(10_000),
        );

        (requester, registry)
    }

    #[test]
    fn dispatch_routes_by_correlation_id() {
        let registry = CorrelationRegistry::new();
        let mut first = registry.register("a");
        let mut second = registry.register("b");

        assert!(registry.dispatch(reply("b", "{}", false)));

        assert!(first.try_recv().is_err());
        assert_eq!(
            second.try_recv().unwrap().properties.correlation_id.as_deref(),
            Some("b")
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_replies_are_dropped() {
        let registry = CorrelationRegistry::new();
        let _waiter = registry.register("a");

        assert!(!registry.dispatch(reply("zzz", "{}", false)));
        assert!(!registry.dispatch(Delivery {
            properties: MessageProperties::default(),
            ..reply("a", "{}", false)
        }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn request_resolves_with_the_reply() {
        let (requester, registry) = requester(|replies, props| {
            assert_eq!(props.reply_to.as_deref(), Some(DIRECT_REPLY_QUEUE));
            let id = props.correlation_id.unwrap();
            replies.dispatch(reply(&id, r#"{"data":{"pong":true}}"#, false));
            Ok(())
        });

        let result: Result<Value, _> = requester
            .request("X", "rk", &json!({"ping": 1}), None, PublishOptions::new())
            .await;

        assert_eq!(result, Ok(json!({"pong": true})));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn error_replies_become_application_errors() {
        let (requester, _) = requester(|replies, props| {
            let id = props.correlation_id.unwrap();
            replies.dispatch(reply(
                &id,
                r#"{"error":{"code":"E1","message":"boom"}}"#,
                true,
            ));
            Ok(())
        });

        let result: Result<Value, _> = requester
            .request("X", "rk", "ping", None, PublishOptions::new())
            .await;

        assert_eq!(
            result,
            Err(AmqpError::Application(ApplicationError::new("E1", "boom")))
        );
    }

    #[tokio::test]
    async fn the_reply_body_wins_over_the_error_header() {
        let (requester, _) = requester(|replies, props| {
            let id = props.correlation_id.unwrap();
            replies.dispatch(reply(&id, r#"{"data":42}"#, true));
            Ok(())
        });

        let result: Result<u32, _> = requester
            .request("X", "rk", "ping", None, PublishOptions::new())
            .await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn unparsable_replies_are_reported() {
        let (requester, _) = requester(|replies, props| {
            let id = props.correlation_id.unwrap();
            replies.dispatch(reply(&id, "not json", false));
            Ok(())
        });

        let result: Result<Value, _> = requester
            .request("X", "rk", "ping", None, PublishOptions::new())
            .await;

        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[tokio::test]
    async fn times_out_without_a_reply() {
        let (requester, registry) = requester(|_, _| Ok(()));

        let started = Instant::now();
        let result: Result<Value, _> = requester
            .request(
                "X",
                "rk",
                "ping",
                Some(Duration::from_millis(50)),
                PublishOptions::new(),
            )
            .await;

        assert_eq!(result, Err(AmqpError::Timeout(50)));
        assert!(result.unwrap_err().is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn late_replies_are_dropped() {
        let sent = Arc::new(Mutex::new(None));
        let recorded = sent.clone();
        let (requester, registry) = requester(move |_, props| {
            *recorded.lock().unwrap() = props.correlation_id;
            Ok(())
        });

        let result: Result<Value, _> = requester
            .request(
                "X",
                "rk",
                "ping",
                Some(Duration::from_millis(10)),
                PublishOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(AmqpError::Timeout(10))));

        let id = sent.lock().unwrap().clone().unwrap();
        assert!(!registry.dispatch(reply(&id, r#"{"data":1}"#, false)));
    }

    #[tokio::test]
    async fn publish_failures_release_the_waiter() {
        let (requester, registry) = requester(|_, _| Err(AmqpError::PublishNotConfirmed));

        let result: Result<Value, _> = requester
            .request("X", "rk", "ping", None, PublishOptions::new())
            .await;

        assert_eq!(result, Err(AmqpError::PublishNotConfirmed));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_requests_release_their_waiters() {
        let (requester, registry) = requester(|_, _| Ok(()));

        for _ in 0..100 {
            let request = requester.request::<_, Value>(
                "X",
                "rk",
                "ping",
                Some(Duration::from_secs(60)),
                PublishOptions::new(),
            );
            assert!(tokio::time::timeout(Duration::from_millis(1), request)
                .await
                .is_err());
        }

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn abandoned_requests_fail_with_closed_reply_channel() {
        let (requester, _) = requester(|replies, _| {
            assert_eq!(replies.abandon_all(), 1);
            Ok(())
        });

        let result: Result<Value, _> = requester
            .request("X", "rk", "ping", None, PublishOptions::new())
            .await;

        assert_eq!(result, Err(AmqpError::ReplyChannelClosed));
    }

    #[tokio::test]
    async fn caller_options_are_kept_but_reply_routing_is_forced() {
        let (requester, _) = requester(|replies, props| {
            assert_eq!(props.message_id.as_deref(), Some("m-1"));
            assert_eq!(props.reply_to.as_deref(), Some(DIRECT_REPLY_QUEUE));
            let id = props.correlation_id.unwrap();
            assert_ne!(id, "mine");
            replies.dispatch(reply(&id, r#"{"data":null}"#, false));
            Ok(())
        });

        let options = PublishOptions::new()
            .with_message_id("m-1")
            .with_correlation_id("mine")
            .with_reply_to("elsewhere");

        let result: Result<(), _> = requester
            .request("X", "rk", "ping", None, options)
            .await;

        assert_eq!(result, Ok(()));
    }
}
