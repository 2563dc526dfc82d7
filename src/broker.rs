// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seams
//!
//! The binder talks to RabbitMQ through two planes:
//!
//! - the data plane (`Connector` -> `BrokerConnection` -> `BrokerChannel`) used to
//!   publish, consume and acknowledge messages;
//! - the management plane (`BrokerAdmin`) used to declare exchanges, queues and
//!   bindings.
//!
//! `channel` and `admin` implement both over lapin; `memory` implements them in
//! process.

use crate::{
    errors::BinderError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Message headers, in the AMQP field-table representation.
pub type Headers = BTreeMap<ShortString, AMQPValue>;

/// Stream of deliveries produced by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BinderError>>;

/// AMQP basic properties the binder reads or writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    /// 2 for persistent messages
    pub delivery_mode: Option<u8>,
    pub headers: Headers,
}

impl MessageProperties {
    /// Reads a long-string header as UTF-8.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes()).ok(),
            Some(AMQPValue::ShortString(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Publisher confirm outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode
    NotRequested,
}

/// Settles a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BinderError>;
    async fn nack(&self, requeue: bool) -> Result<(), BinderError>;
}

/// A message received from a queue.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Delivery {
            body,
            properties,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BinderError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BinderError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}

/// A multiplexed channel over a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Puts the channel in publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), BinderError>;

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BinderError>;

    /// Publishes and, in confirm mode, waits for the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<Confirmation, BinderError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BinderError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BinderError>;

    async fn close(&self) -> Result<(), BinderError>;
}

/// A physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BinderError>;

    async fn close(&self) -> Result<(), BinderError>;
}

/// Opens connections to one of the configured endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BinderError>;
}

/// Management-plane declarations. Every call must be idempotent for identical
/// attributes and fail with `TopologyConflict` when the broker object exists with
/// different ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BinderError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BinderError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BinderError>;
}
