// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Wire framing used by the adapter:
//!
//! - `ReplyEnvelope` is the body of every RPC reply. It is serialized as
//!   `{"data": ...}` for a successful reply and as
//!   `{"error": {"code": ..., "message": ...}}` for an application error.
//!   Error replies also carry the `x-is-rpc-error: true` header.
//! - `Envelope` is an optional self-describing frame for pub/sub payloads,
//!   stamped with a fresh identity, a type name and a schema version.

use crate::{channel::MessageProperties, errors::ApplicationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header flagging a reply as an application error.
pub const RPC_ERROR_HEADER: &str = "x-is-rpc-error";

/// Self-describing frame around a published payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    #[serde(rename = "emittedAt", default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<String>,
    #[serde(rename = "emittedBy", default, skip_serializing_if = "Option::is_none")]
    pub emitted_by: Option<String>,
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Records when the payload was emitted (RFC 3339 timestamp).
    pub fn emitted_at(mut self, at: impl Into<String>) -> Self {
        self.emitted_at = Some(at.into());
        self
    }

    /// Records which service emitted the payload.
    pub fn emitted_by(mut self, by: impl Into<String>) -> Self {
        self.emitted_by = Some(by.into());
        self
    }
}

/// Body of an RPC reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyEnvelope<R> {
    Data(R),
    Error(ApplicationError),
}

impl<R> ReplyEnvelope<R> {
    pub fn is_error(&self) -> bool {
        matches!(self, ReplyEnvelope::Error(_))
    }
}

impl<R> From<Result<R, ApplicationError>> for ReplyEnvelope<R> {
    fn from(result: Result<R, ApplicationError>) -> Self {
        match result {
            Ok(payload) => create_reply_envelope_for_reply(payload),
            Err(err) => create_reply_envelope_for_error(&err),
        }
    }
}

/// Frames `payload` with a fresh identity.
pub fn create_envelope_for_payload<P>(kind: &str, version: u32, payload: P) -> Envelope<P> {
    Envelope {
        uuid: Uuid::new_v4().to_string(),
        kind: kind.to_owned(),
        version,
        emitted_at: None,
        emitted_by: None,
        payload,
    }
}

pub fn create_reply_envelope_for_reply<R>(payload: R) -> ReplyEnvelope<R> {
    ReplyEnvelope::Data(payload)
}

pub fn create_reply_envelope_for_error<R>(err: &ApplicationError) -> ReplyEnvelope<R> {
    ReplyEnvelope::Error(ApplicationError::new(&err.code, &err.message))
}

/// Unwraps a reply: the payload on success, the application error otherwise.
pub fn decode_reply_envelope<R>(envelope: ReplyEnvelope<R>) -> Result<R, ApplicationError> {
    match envelope {
        ReplyEnvelope::Data(payload) => Ok(payload),
        ReplyEnvelope::Error(err) => Err(err),
    }
}

/// Whether the reply is flagged as an error. Only a boolean `true` counts.
pub fn is_rpc_error(props: &MessageProperties) -> bool {
    props
        .headers
        .get(RPC_ERROR_HEADER)
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
}
