// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Channel Binder
//!
//! [`RabbitMessageChannelBinder`] turns binding requests into live producers and
//! consumers. Its collaborators are created in a fixed order by [`BinderBuilder`]:
//! codec, connection manager, topology provisioner, then the binder itself. The
//! builder also accepts replacements for the broker planes and the compression
//! pipeline, which is how the in-process broker is plugged in.
//!
//! Every `bind_*` call runs the same steps: validate the binding spec, provision the
//! topology, open the channel(s), then move the binding to `Active`. A failure in
//! any step marks that binding `Failed` and leaves the others untouched.

use crate::{
    admin::admin_from_config,
    binding::{BindingHandle, BindingRole, BindingSpec, BindingState, Lifecycle},
    broker::{BrokerAdmin, Connector},
    channel::AmqpConnector,
    codec::{Codec, JsonCodec},
    compression::CompressionPipeline,
    config::{BinderConfig, BindingOptions},
    connection::{ChannelSettings, ConnectionManager, ConnectionStatus, Direction},
    consumer::{ConsumerBinding, ConsumerHandler, ConsumerPipeline, Decoder, InboundMessage, StreamForwarder},
    errors::BinderError,
    producer::{ProducerBinding, ProducerParts, SendGate},
    provisioner::ExchangeQueueProvisioner,
    topology::NamingStrategy,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Health of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingHealth {
    pub destination: String,
    pub group: Option<String>,
    pub role: BindingRole,
    pub state: BindingState,
}

/// Snapshot of the binder health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinderHealth {
    pub connection: ConnectionStatus,
    /// Endpoint of the current connection
    pub endpoint: Option<String>,
    pub bindings: Vec<BindingHealth>,
}

impl BinderHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.connection,
            ConnectionStatus::Idle | ConnectionStatus::Connected
        ) && self.bindings.iter().all(|b| b.state != BindingState::Failed)
    }
}

/// Assembles a [`RabbitMessageChannelBinder`].
pub struct BinderBuilder<C: Codec = JsonCodec> {
    config: BinderConfig,
    codec: C,
    connector: Option<Arc<dyn Connector>>,
    admin: Option<Arc<dyn BrokerAdmin>>,
    compression: Option<CompressionPipeline>,
}

impl BinderBuilder<JsonCodec> {
    pub fn new(config: BinderConfig) -> Self {
        BinderBuilder {
            config,
            codec: JsonCodec,
            connector: None,
            admin: None,
            compression: None,
        }
    }
}

impl<C: Codec> BinderBuilder<C> {
    pub fn codec<D: Codec>(self, codec: D) -> BinderBuilder<D> {
        BinderBuilder {
            config: self.config,
            codec,
            connector: self.connector,
            admin: self.admin,
            compression: self.compression,
        }
    }

    /// Replaces the lapin data plane.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the lapin management plane.
    pub fn admin(mut self, admin: Arc<dyn BrokerAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Replaces the pipeline derived from `compression_level` and `compression_algorithm`.
    pub fn compression(mut self, compression: CompressionPipeline) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn build(self) -> Result<RabbitMessageChannelBinder<C>, BinderError> {
        self.config.validate()?;
        let config = self.config;

        let codec = Arc::new(self.codec);

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(AmqpConnector::new(&config.rabbitmq)));
        let connections = ConnectionManager::new(
            connector,
            config.rabbitmq.addresses.clone(),
            &config.app_name,
            config.connection_retry.clone(),
        );

        let admin = self
            .admin
            .unwrap_or_else(|| Arc::new(admin_from_config(&config)));
        let provisioner = Arc::new(ExchangeQueueProvisioner::new(
            admin,
            NamingStrategy::new(&config.prefix),
            config.provisioning_retry.clone(),
            config.provisioning_timeout(),
        ));

        let compression = self.compression.unwrap_or_else(|| {
            CompressionPipeline::with_level(config.compression_algorithm, config.compression_level)
        });

        info!(
            app = config.app_name.as_str(),
            endpoints = config.rabbitmq.addresses.len(),
            compression_level = config.compression_level,
            "binder configured"
        );

        Ok(RabbitMessageChannelBinder {
            config,
            codec,
            connections,
            provisioner,
            compression,
            gate: SendGate::new(),
            bindings: Mutex::new(vec![]),
            shutting_down: AtomicBool::new(false),
        })
    }
}

/// Binds producers and consumers to RabbitMQ destinations.
pub struct RabbitMessageChannelBinder<C: Codec = JsonCodec> {
    config: BinderConfig,
    codec: Arc<C>,
    connections: Arc<ConnectionManager>,
    provisioner: Arc<ExchangeQueueProvisioner>,
    compression: CompressionPipeline,
    gate: Arc<SendGate>,
    bindings: Mutex<Vec<Arc<dyn BindingHandle>>>,
    shutting_down: AtomicBool,
}

impl RabbitMessageChannelBinder<JsonCodec> {
    /// Binder over lapin with the JSON codec. No connection is opened until the
    /// first binding needs one.
    pub fn connect(config: BinderConfig) -> Result<Self, BinderError> {
        BinderBuilder::new(config).build()
    }
}

impl<C: Codec> RabbitMessageChannelBinder<C> {
    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connections.status()
    }

    /// Binds a producer to the destination of `spec`.
    pub async fn bind_producer(&self, spec: BindingSpec) -> Result<ProducerBinding<C>, BinderError> {
        self.ensure_running()?;
        spec.validate(BindingRole::Producer)?;

        let options = self.options_for(&spec);
        options.producer.validate()?;

        let lifecycle = Lifecycle::new(&spec);
        lifecycle.transition(BindingState::Provisioning)?;

        let topology = match self
            .provisioner
            .provision_producer(spec.destination(), &options.producer, &options.consumer)
            .await
        {
            Ok(topology) => topology,
            Err(err) => return Err(self.failed(&lifecycle, err)),
        };

        let channel = match self
            .connections
            .open_channel(Direction::Outbound, ChannelSettings::outbound())
            .await
        {
            Ok(channel) => channel,
            Err(err) => return Err(self.failed(&lifecycle, err)),
        };

        lifecycle.transition(BindingState::Active)?;
        info!(binding = lifecycle.label(), exchange = topology.exchange_name(), "producer binding active");

        let binding = ProducerBinding::new(ProducerParts {
            spec,
            options: options.producer,
            topology,
            naming: self.provisioner.naming().clone(),
            lifecycle,
            channel,
            connections: self.connections.clone(),
            codec: self.codec.clone(),
            compression: self.compression.clone(),
            gate: self.gate.clone(),
        });

        self.register(Arc::new(binding.clone()));
        Ok(binding)
    }

    /// Binds a consumer whose payloads are decoded with the binder codec.
    pub async fn bind_consumer<T>(
        &self,
        spec: BindingSpec,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Result<ConsumerBinding, BinderError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        let decode: Decoder<T> = Arc::new(move |bytes: &[u8]| codec.decode::<T>(bytes));

        self.bind_consumer_with(spec, decode, handler).await
    }

    /// Binds a consumer that receives payload bytes without running the codec.
    pub async fn bind_raw_consumer(
        &self,
        spec: BindingSpec,
        handler: Arc<dyn ConsumerHandler<Vec<u8>>>,
    ) -> Result<ConsumerBinding, BinderError> {
        let decode: Decoder<Vec<u8>> = Arc::new(|bytes: &[u8]| Ok(bytes.to_vec()));

        self.bind_consumer_with(spec, decode, handler).await
    }

    /// Binds a consumer and exposes its messages as a channel. A message is
    /// acknowledged once the receiver has room for it.
    pub async fn bind_consumer_stream<T>(
        &self,
        spec: BindingSpec,
    ) -> Result<(ConsumerBinding, mpsc::Receiver<InboundMessage<T>>), BinderError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let options = self.options_for(&spec);
        let capacity = usize::from(options.consumer.prefetch.max(1)) * options.consumer.concurrency.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let binding = self
            .bind_consumer(spec, Arc::new(StreamForwarder::new(sender)))
            .await?;

        Ok((binding, receiver))
    }

    async fn bind_consumer_with<T: Send + Sync + 'static>(
        &self,
        spec: BindingSpec,
        decode: Decoder<T>,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Result<ConsumerBinding, BinderError> {
        self.ensure_running()?;
        spec.validate(BindingRole::Consumer)?;

        let options = self.options_for(&spec);
        options.consumer.validate()?;

        let lifecycle = Lifecycle::new(&spec);
        lifecycle.transition(BindingState::Provisioning)?;

        let topology = match self
            .provisioner
            .provision_consumer(spec.destination(), spec.group(), &options.consumer)
            .await
        {
            Ok(topology) => topology,
            Err(err) => return Err(self.failed(&lifecycle, err)),
        };

        let mut channels = Vec::with_capacity(options.consumer.concurrency);
        for _ in 0..options.consumer.concurrency {
            match self
                .connections
                .open_channel(
                    Direction::Inbound,
                    ChannelSettings::inbound(options.consumer.prefetch),
                )
                .await
            {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    for channel in &channels {
                        if let Err(err) = self.connections.close_channel(channel).await {
                            warn!(error = err.to_string(), "failure to close consumer channel");
                        }
                    }
                    return Err(self.failed(&lifecycle, err));
                }
            }
        }

        let binding = ConsumerBinding::start(
            ConsumerPipeline {
                spec,
                options: options.consumer,
                topology,
                compression: self.compression.clone(),
                decode,
                handler,
                provisioner: self.provisioner.clone(),
                connections: self.connections.clone(),
            },
            lifecycle,
            channels,
            self.config.shutdown_timeout(),
        )?;

        self.register(Arc::new(binding.clone()));
        Ok(binding)
    }

    /// Stops `binding` and forgets it. Broker topology is left in place.
    pub async fn unbind(&self, binding: &dyn BindingHandle) -> Result<(), BinderError> {
        let result = binding.unbind().await;
        self.bindings.lock().retain(|b| b.id() != binding.id());
        result
    }

    /// Stops consumers, refuses new sends, waits up to `shutdown_timeout` for
    /// in-flight publishes, unbinds everything and closes the connection.
    pub async fn shutdown(&self) -> Result<(), BinderError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("shutting down binder");
        let bindings: Vec<Arc<dyn BindingHandle>> = self.bindings.lock().drain(..).collect();

        let (consumers, producers): (Vec<_>, Vec<_>) = bindings
            .into_iter()
            .partition(|b| b.spec().role() == BindingRole::Consumer);

        for consumer in &consumers {
            if let Err(err) = consumer.unbind().await {
                error!(error = err.to_string(), "failure to stop consumer binding");
            }
        }

        self.gate.close();
        if !self.gate.drain(self.config.shutdown_timeout()).await {
            warn!(
                in_flight = self.gate.in_flight(),
                "shutdown timeout elapsed with publishes in flight"
            );
        }

        for producer in &producers {
            if let Err(err) = producer.unbind().await {
                error!(error = err.to_string(), "failure to stop producer binding");
            }
        }

        self.connections.shutdown().await
    }

    pub async fn health(&self) -> BinderHealth {
        let bindings = self
            .bindings
            .lock()
            .iter()
            .map(|b| BindingHealth {
                destination: b.spec().destination().to_owned(),
                group: b.spec().group().map(str::to_owned),
                role: b.spec().role(),
                state: b.state(),
            })
            .collect();

        BinderHealth {
            connection: self.connections.status(),
            endpoint: self.connections.current_endpoint().await,
            bindings,
        }
    }

    fn ensure_running(&self) -> Result<(), BinderError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(BinderError::BinderShuttingDown)
        } else {
            Ok(())
        }
    }

    fn options_for(&self, spec: &BindingSpec) -> BindingOptions {
        spec.options()
            .cloned()
            .unwrap_or_else(|| self.config.binding_options(spec.destination()))
    }

    fn failed(&self, lifecycle: &Lifecycle, err: BinderError) -> BinderError {
        error!(binding = lifecycle.label(), error = err.to_string(), "failure to bind");
        lifecycle.fail(&err);
        err
    }

    fn register(&self, binding: Arc<dyn BindingHandle>) {
        let mut bindings = self.bindings.lock();
        bindings.retain(|b| b.state() != BindingState::Stopped);
        bindings.push(binding);
    }
}
