// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ adapter: declarative topology setup, confirmed JSON publishing,
//! event and RPC consumers, and request/reply over direct reply-to.

mod otel;

pub mod adapter;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod request;
pub mod resilient;
pub mod topology;

pub use adapter::RabbitMQAdapter;
pub use channel::{Delivery, HeaderValue, MessageProperties};
pub use config::AmqpConfigs;
pub use consumer::{EventHandler, HandlerError, RpcHandler};
pub use errors::{AmqpError, ApplicationError};
pub use publisher::PublishOptions;
pub use topology::AmqpTopology;
