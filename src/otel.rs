// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module propagates trace context through message headers. Publishers
//! inject the current context into outgoing headers and consumers extract it
//! to parent the span covering the processing of a delivery.

use crate::channel::{HeaderValue, Headers, MessageProperties};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

pub(crate) const TRACER_NAME: &str = "amqp consumer";

/// Writes trace context entries into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

/// Reads trace context entries from incoming message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` with the global propagator.
pub(crate) fn inject_context(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from message properties and
/// creates a consumer span parented by it.
///
/// # Parameters
/// * `props` - Message properties containing headers
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the queue name)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    props: &MessageProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(&props.headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();

        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::String("00-abc-01".to_owned()))
        );
    }

    #[test]
    fn extractor_only_reads_string_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), HeaderValue::from("00-abc-01"));
        headers.insert("x-is-rpc-error".to_owned(), HeaderValue::Bool(true));

        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc-01"));
        assert_eq!(extractor.get("x-is-rpc-error"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
