// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binder Configuration
//!
//! A single explicit configuration value consumed once when the binder is built.
//! Broker connection parameters, the management-plane addresses, the compression
//! policy, retry budgets and the per-destination binding options all live here and
//! are validated eagerly by [`BinderConfig::validate`].

use crate::{compression::CompressionAlgorithm, errors::BinderError, exchange::ExchangeKind};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, time::Duration};

/// Exponential backoff budget shared by reconnection, provisioning, publishing and
/// consumer retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_interval_ms: initial_interval.as_millis() as u64,
            ..RetryPolicy::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval_ms = max_interval.as_millis() as u64;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_interval_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_interval_ms as f64) as u64)
    }

    fn validate(&self, name: &str) -> Result<(), BinderError> {
        if self.max_attempts == 0 {
            return Err(BinderError::InvalidConfig(format!(
                "{name}.max_attempts must be at least 1"
            )));
        }

        if self.multiplier < 1.0 {
            return Err(BinderError::InvalidConfig(format!(
                "{name}.multiplier must be >= 1.0"
            )));
        }

        Ok(())
    }
}

/// Data-plane connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitConfig {
    /// Ordered `host:port` list, tried in order on (re)connection
    pub addresses: Vec<String>,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        RabbitConfig {
            addresses: vec!["localhost:5672".to_owned()],
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
        }
    }
}

impl RabbitConfig {
    /// Builds the AMQP URI for one of the configured addresses.
    pub fn uri(&self, address: &str) -> String {
        format!(
            "amqp://{}:{}@{}/{}",
            self.user, self.password, address, self.vhost
        )
    }
}

/// Producer-side binding options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    pub exchange_type: ExchangeKind,
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    /// Overrides the default routing key (the destination name)
    pub routing_key: Option<String>,
    /// Run outbound payloads through the compressing post-processor
    pub compress: bool,
    /// Groups whose queues are provisioned with the producer so messages are retained
    /// before any consumer binds
    pub required_groups: Vec<String>,
    pub partition_count: u32,
    /// Publish with delivery mode 2
    pub persistent: bool,
    /// Budget for broker nacks before a send fails with `PublishRejected`
    pub publish_retry: RetryPolicy,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            exchange_type: ExchangeKind::Topic,
            exchange_durable: true,
            exchange_auto_delete: false,
            routing_key: None,
            compress: true,
            required_groups: vec![],
            partition_count: 1,
            persistent: true,
            publish_retry: RetryPolicy::new(3, Duration::from_millis(100)),
        }
    }
}

impl ProducerOptions {
    pub fn validate(&self) -> Result<(), BinderError> {
        if self.partition_count == 0 {
            return Err(BinderError::InvalidConfig(
                "producer.partition_count must be at least 1".to_owned(),
            ));
        }

        self.publish_retry.validate("producer.publish_retry")
    }
}

/// Consumer-side binding options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub exchange_type: ExchangeKind,
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    pub binding_routing_key: String,
    /// Group queues survive broker restarts
    pub durable_subscription: bool,
    /// Declare a DLX/DLQ pair and point the queue at it
    pub auto_bind_dlq: bool,
    /// Republish failed messages to the DLQ with exception headers instead of rejecting
    pub republish_to_dlq: bool,
    pub requeue_rejected: bool,
    pub prefetch: u16,
    /// Number of concurrent consumers, each on its own channel
    pub concurrency: usize,
    /// In-process handler retries before the message is rejected
    pub retry: RetryPolicy,
    pub ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub partitioned: bool,
    pub instance_index: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            exchange_type: ExchangeKind::Topic,
            exchange_durable: true,
            exchange_auto_delete: false,
            binding_routing_key: "#".to_owned(),
            durable_subscription: true,
            auto_bind_dlq: false,
            republish_to_dlq: false,
            requeue_rejected: false,
            prefetch: 1,
            concurrency: 1,
            retry: RetryPolicy::default(),
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            partitioned: false,
            instance_index: 0,
        }
    }
}

impl ConsumerOptions {
    pub fn validate(&self) -> Result<(), BinderError> {
        if self.prefetch == 0 {
            return Err(BinderError::InvalidConfig(
                "consumer.prefetch must be at least 1".to_owned(),
            ));
        }

        if self.concurrency == 0 {
            return Err(BinderError::InvalidConfig(
                "consumer.concurrency must be at least 1".to_owned(),
            ));
        }

        if self.republish_to_dlq && !self.auto_bind_dlq {
            return Err(BinderError::InvalidConfig(
                "consumer.republish_to_dlq requires consumer.auto_bind_dlq".to_owned(),
            ));
        }

        self.retry.validate("consumer.retry")
    }
}

/// Options for one destination, as in `bindings.<destination>` of the config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingOptions {
    pub producer: ProducerOptions,
    pub consumer: ConsumerOptions,
}

impl BindingOptions {
    pub fn validate(&self) -> Result<(), BinderError> {
        self.producer.validate()?;
        self.consumer.validate()
    }
}

/// Top-level binder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Used as the AMQP connection name
    pub app_name: String,
    pub rabbitmq: RabbitConfig,
    /// Addresses used for topology declarations; the data addresses when empty
    pub admin_addresses: Vec<String>,
    /// Node names paired with `admin_addresses`
    pub nodes: Vec<String>,
    pub compression_level: u32,
    pub compression_algorithm: CompressionAlgorithm,
    /// Prepended to every exchange and queue name
    pub prefix: String,
    pub connection_retry: RetryPolicy,
    pub provisioning_retry: RetryPolicy,
    pub provisioning_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub bindings: HashMap<String, BindingOptions>,
}

impl Default for BinderConfig {
    fn default() -> Self {
        BinderConfig {
            app_name: "rabbit-binder".to_owned(),
            rabbitmq: RabbitConfig::default(),
            admin_addresses: vec![],
            nodes: vec![],
            compression_level: 0,
            compression_algorithm: CompressionAlgorithm::Gzip,
            prefix: "".to_owned(),
            connection_retry: RetryPolicy::new(5, Duration::from_millis(500)),
            provisioning_retry: RetryPolicy::new(3, Duration::from_millis(500)),
            provisioning_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            bindings: HashMap::default(),
        }
    }
}

impl BinderConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json(raw: &str) -> Result<BinderConfig, BinderError> {
        let cfg: BinderConfig =
            serde_json::from_str(raw).map_err(|err| BinderError::InvalidConfig(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads the configuration from environment variables on top of the defaults.
    pub fn from_env() -> Result<BinderConfig, BinderError> {
        let mut cfg = BinderConfig::default();

        if let Ok(name) = env::var("APP_NAME") {
            cfg.app_name = name;
        }
        if let Ok(addresses) = env::var("RABBITMQ_ADDRESSES") {
            cfg.rabbitmq.addresses = split_list(&addresses);
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.rabbitmq.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.rabbitmq.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.rabbitmq.vhost = vhost;
        }
        if let Ok(admin) = env::var("RABBITMQ_ADMIN_ADDRESSES") {
            cfg.admin_addresses = split_list(&admin);
        }
        if let Ok(nodes) = env::var("RABBITMQ_NODES") {
            cfg.nodes = split_list(&nodes);
        }
        if let Ok(prefix) = env::var("BINDER_PREFIX") {
            cfg.prefix = prefix;
        }
        if let Ok(level) = env::var("BINDER_COMPRESSION_LEVEL") {
            cfg.compression_level = level.trim().parse().map_err(|_| {
                BinderError::InvalidConfig(format!("invalid compression level `{level}`"))
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BinderError> {
        if self.rabbitmq.addresses.is_empty()
            || self.rabbitmq.addresses.iter().any(|a| a.trim().is_empty())
        {
            return Err(BinderError::InvalidConfig(
                "rabbitmq.addresses must contain at least one address".to_owned(),
            ));
        }

        if self.compression_level > 9 {
            return Err(BinderError::InvalidConfig(format!(
                "compression_level must be within 0..=9, got {}",
                self.compression_level
            )));
        }

        if !self.nodes.is_empty() && self.nodes.len() != self.admin_addresses.len() {
            return Err(BinderError::InvalidConfig(
                "nodes and admin_addresses must have the same length".to_owned(),
            ));
        }

        if self.provisioning_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            return Err(BinderError::InvalidConfig(
                "timeouts must be greater than zero".to_owned(),
            ));
        }

        self.connection_retry.validate("connection_retry")?;
        self.provisioning_retry.validate("provisioning_retry")?;

        for (destination, options) in &self.bindings {
            options.validate().map_err(|err| match err {
                BinderError::InvalidConfig(msg) => {
                    BinderError::InvalidConfig(format!("bindings.{destination}: {msg}"))
                }
                other => other,
            })?;
        }

        Ok(())
    }

    /// Addresses used by the management plane.
    pub fn admin_endpoints(&self) -> Vec<String> {
        if self.admin_addresses.is_empty() {
            self.rabbitmq.addresses.clone()
        } else {
            self.admin_addresses.clone()
        }
    }

    /// Options configured for a destination, or the defaults.
    pub fn binding_options(&self, destination: &str) -> BindingOptions {
        self.bindings.get(destination).cloned().unwrap_or_default()
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
