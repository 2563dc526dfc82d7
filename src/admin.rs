// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Topology Administration
//!
//! [`AmqpAdmin`] implements the management plane over a dedicated lapin
//! connection to the admin addresses, which may differ from the node serving
//! the data connection. Each declaration runs on a fresh channel because the broker
//! closes a channel on `PRECONDITION_FAILED`.

use crate::{
    broker::{BrokerAdmin, BrokerConnection},
    channel::{map_lapin_error, new_amqp_connection, AmqpConnection},
    config::RabbitConfig,
    errors::BinderError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// RabbitMQ implementation of [`BrokerAdmin`].
pub struct AmqpAdmin {
    cfg: RabbitConfig,
    addresses: Vec<String>,
    nodes: Vec<String>,
    connection_name: String,
    conn: Mutex<Option<Arc<AmqpConnection>>>,
}

impl AmqpAdmin {
    /// # Parameters
    /// * `cfg` - Credentials and vhost
    /// * `addresses` - Admin addresses, tried in order
    /// * `nodes` - Node names paired with `addresses`, may be empty
    /// * `connection_name` - Base name of the admin connection
    pub fn new(cfg: &RabbitConfig, addresses: Vec<String>, nodes: Vec<String>, connection_name: &str) -> Self {
        AmqpAdmin {
            cfg: cfg.clone(),
            addresses,
            nodes,
            connection_name: format!("{}-admin", connection_name),
            conn: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel, BinderError> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_open() {
                return conn.raw_channel().await;
            }
        }

        let mut last_err = BinderError::ConnectionError("no admin address configured".to_owned());
        for (idx, address) in self.addresses.iter().enumerate() {
            let node = self.nodes.get(idx).map(String::as_str).unwrap_or(address.as_str());
            debug!(node = node, "opening admin connection");

            match new_amqp_connection(&self.cfg.uri(address), &self.connection_name).await {
                Ok(conn) => {
                    let conn = Arc::new(AmqpConnection::from_lapin(conn));
                    let channel = conn.raw_channel().await?;
                    *guard = Some(conn);
                    return Ok(channel);
                }
                Err(err) => {
                    warn!(node = node, error = err.to_string(), "admin address unreachable");
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }
}

#[async_trait]
impl BrokerAdmin for AmqpAdmin {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BinderError> {
        debug!("creating exchange: {}", def.name);
        let channel = self.channel().await?;

        let result = channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        close_quietly(&channel).await;

        match result {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(map_lapin_error(&err, BinderError::DeclareExchangeError))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BinderError> {
        debug!("creating queue: {}", def.name);
        let channel = self.channel().await?;

        let result = channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(def.arguments()),
            )
            .await;

        close_quietly(&channel).await;

        match result {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(map_lapin_error(&err, |_| BinderError::DeclareQueueError(def.name.clone())))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BinderError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        let channel = self.channel().await?;

        let result = channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await;

        close_quietly(&channel).await;

        match result {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(map_lapin_error(&err, |_| {
                    BinderError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                }))
            }
            _ => Ok(()),
        }
    }
}

async fn close_quietly(channel: &Channel) {
    if channel.status().connected() {
        if let Err(err) = channel.close(200, "OK").await {
            debug!(error = err.to_string(), "admin channel already closed");
        }
    }
}

/// Admin over the configured admin addresses (or the data addresses when none are set).
pub fn admin_from_config(cfg: &crate::config::BinderConfig) -> AmqpAdmin {
    AmqpAdmin::new(&cfg.rabbitmq, cfg.admin_endpoints(), cfg.nodes.clone(), &cfg.app_name)
}
