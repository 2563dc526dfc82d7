// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the data-plane seams of [`crate::broker`] over lapin. It
//! establishes connections to one of the configured RabbitMQ addresses and exposes
//! lapin channels as [`BrokerChannel`]s: publisher confirms, prefetch, consumers and
//! acknowledgements.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Confirmation, Connector, Delivery, DeliveryAcker,
        DeliveryStream, MessageProperties, OutboundMessage,
    },
    config::RabbitConfig,
    errors::BinderError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error};

/// Creates a new AMQP connection.
///
/// # Parameters
/// * `uri` - AMQP URI including credentials and vhost
/// * `connection_name` - Name shown in the RabbitMQ management UI
pub async fn new_amqp_connection(uri: &str, connection_name: &str) -> Result<Connection, BinderError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    match Connection::connect(uri, options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(BinderError::ConnectionError(err.to_string()))
        }
    }
}

/// Maps lapin errors, classifying connection loss and precondition failures.
pub(crate) fn map_lapin_error(
    err: &lapin::Error,
    otherwise: impl FnOnce(String) -> BinderError,
) -> BinderError {
    match err {
        lapin::Error::IOError(..) | lapin::Error::InvalidConnectionState(..) => {
            BinderError::ConnectionLost(err.to_string())
        }
        lapin::Error::InvalidChannelState(..) => BinderError::ChannelError(err.to_string()),
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            BinderError::TopologyConflict(amqp.to_string())
        }
        _ => otherwise(err.to_string()),
    }
}

/// [`Connector`] that opens lapin connections.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    cfg: RabbitConfig,
}

impl AmqpConnector {
    pub fn new(cfg: &RabbitConfig) -> Self {
        AmqpConnector { cfg: cfg.clone() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        address: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BinderError> {
        let conn = new_amqp_connection(&self.cfg.uri(address), connection_name).await?;
        Ok(Arc::new(AmqpConnection::from_lapin(conn)))
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    conn: Connection,
}

impl AmqpConnection {
    pub(crate) fn from_lapin(conn: Connection) -> Self {
        AmqpConnection { conn }
    }

    /// Opens a raw lapin channel, used by the management plane.
    pub(crate) async fn raw_channel(&self) -> Result<Channel, BinderError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_lapin_error(&err, BinderError::ChannelError))
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BinderError> {
        let channel = self.raw_channel().await?;
        Ok(Arc::new(AmqpChannel {
            channel,
            confirms: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BinderError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            BinderError::ConnectionError(err.to_string())
        })
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
    confirms: AtomicBool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self) -> Result<(), BinderError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                map_lapin_error(&err, BinderError::ChannelError)
            })?;

        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BinderError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                map_lapin_error(&err, BinderError::QoSDeclarationError)
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<Confirmation, BinderError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(map_lapin_error(&err, BinderError::PublishingError))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(Confirmation::NotRequested);
        }

        match confirm.await {
            Ok(publisher_confirm::Confirmation::Ack(_)) => Ok(Confirmation::Ack),
            Ok(publisher_confirm::Confirmation::Nack(_)) => Ok(Confirmation::Nack),
            Ok(publisher_confirm::Confirmation::NotRequested) => Ok(Confirmation::NotRequested),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for the publisher confirm");
                Err(map_lapin_error(&err, BinderError::PublishingError))
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BinderError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to create the consumer");
                Err(map_lapin_error(&err, BinderError::ConsumerDeclarationError))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.data,
                    from_basic_properties(&delivery.properties),
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )),
                Err(err) => Err(map_lapin_error(&err, BinderError::ConsumerError)),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BinderError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| map_lapin_error(&err, BinderError::ConsumerError))
    }

    async fn close(&self) -> Result<(), BinderError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(200, "OK")
            .await
            .map_err(|err| map_lapin_error(&err, BinderError::ChannelError))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), BinderError> {
        self.0.ack(BasicAckOptions { multiple: false }).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            BinderError::AckMessageError
        })
    }

    async fn nack(&self, requeue: bool) -> Result<(), BinderError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                BinderError::NackMessageError
            })
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(FieldTable::from(props.headers.clone()));

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(content_encoding) = &props.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(content_encoding.clone()));
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(mode) = props.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }

    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        content_encoding: props.content_encoding().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        delivery_mode: *props.delivery_mode(),
        headers: props
            .headers()
            .as_ref()
            .map(|h| h.inner().clone())
            .unwrap_or_default(),
    }
}
