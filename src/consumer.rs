// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Bindings
//!
//! A [`ConsumerBinding`] runs `concurrency` workers against the queue of its
//! destination and group. Each worker owns an inbound channel with the configured
//! prefetch and processes deliveries one at a time: decompress, decode, call the
//! handler (retrying in process with backoff), then acknowledge.
//!
//! A message that cannot be decoded or whose handler keeps failing is either
//! republished to the dead letter queue with exception headers and acknowledged, or
//! rejected so the broker dead-letters or requeues it. Neither stops the worker.
//!
//! Workers survive connection loss: the delivery stream ends, the channel is
//! re-acquired on the new connection and, for auto-delete queues, the topology is
//! declared again before consuming resumes.

use crate::{
    binding::{BindingHandle, BindingSpec, BindingState, Lifecycle},
    broker::{BrokerChannel, Delivery, DeliveryStream, MessageProperties, OutboundMessage},
    compression::{CompressionPipeline, EncodedPayload},
    config::ConsumerOptions,
    connection::{ConnectionManager, ConnectionStatus, ManagedChannel},
    errors::BinderError,
    otel,
    provisioner::ExchangeQueueProvisioner,
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use parking_lot::Mutex;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header carrying the failure that sent a message to the dead letter queue
pub const X_EXCEPTION_MESSAGE: &str = "x-exception-message";
/// Header carrying the exchange a dead-lettered message was originally published to
pub const X_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header carrying the routing key a dead-lettered message was originally published with
pub const X_ORIGINAL_ROUTING_KEY: &str = "x-original-routingKey";

/// A decoded message handed to a consumer handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage<T> {
    pub payload: T,
    pub destination: String,
    pub group: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Properties as received, with the compression marker removed
    pub properties: MessageProperties,
}

/// Application callback for consumer bindings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler<T: Send + Sync + 'static>: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &InboundMessage<T>) -> Result<(), BinderError>;
}

/// Forwards every message to a channel, backing [`crate::binder::RabbitMessageChannelBinder::bind_consumer_stream`].
pub(crate) struct StreamForwarder<T> {
    sender: mpsc::Sender<InboundMessage<T>>,
}

impl<T> StreamForwarder<T> {
    pub(crate) fn new(sender: mpsc::Sender<InboundMessage<T>>) -> Self {
        StreamForwarder { sender }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ConsumerHandler<T> for StreamForwarder<T> {
    async fn exec(&self, _ctx: &Context, msg: &InboundMessage<T>) -> Result<(), BinderError> {
        self.sender
            .send(msg.clone())
            .await
            .map_err(|_| BinderError::ConsumerError("stream receiver dropped".to_owned()))
    }
}

pub(crate) type Decoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, BinderError> + Send + Sync>;

/// Everything a worker needs to process deliveries for one binding.
pub(crate) struct ConsumerPipeline<T> {
    pub spec: BindingSpec,
    pub options: ConsumerOptions,
    pub topology: Topology,
    pub compression: CompressionPipeline,
    pub decode: Decoder<T>,
    pub handler: Arc<dyn ConsumerHandler<T>>,
    pub provisioner: Arc<ExchangeQueueProvisioner>,
    pub connections: Arc<ConnectionManager>,
}

struct Worker<T> {
    pipeline: Arc<ConsumerPipeline<T>>,
    lifecycle: Arc<Lifecycle>,
    channel: Arc<ManagedChannel>,
    tag: String,
}

impl<T: Send + Sync + 'static> Worker<T> {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let queue = self.pipeline.topology.queue_name().unwrap_or_default().to_owned();
        let mut subscriptions = 0u32;

        while !*stop.borrow() {
            let subscribed = self.subscribe(&queue, subscriptions).await;
            subscriptions += 1;

            let (channel, mut deliveries) = match subscribed {
                Ok(subscription) => subscription,
                Err(BinderError::BinderShuttingDown) => return,
                Err(err) => {
                    if self.pipeline.connections.status() == ConnectionStatus::Failed {
                        self.lifecycle.fail(&err);
                        return;
                    }

                    let delay = self.pipeline.options.retry.backoff(subscriptions);
                    warn!(
                        queue = queue.as_str(),
                        error = err.to_string(),
                        delay_ms = delay.as_millis() as u64,
                        "consumer unavailable, retrying"
                    );

                    tokio::select! {
                        _ = stop.changed() => return,
                        _ = time::sleep(delay) => continue,
                    }
                }
            };

            debug!(queue = queue.as_str(), tag = self.tag.as_str(), "consumer started");

            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if let Err(err) = channel.cancel(&self.tag).await {
                            debug!(error = err.to_string(), "consumer already cancelled");
                        }
                        return;
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => self.handle(&channel, delivery).await,
                        Some(Err(err)) => {
                            error!(error = err.to_string(), "errors consume msg");
                            self.channel.invalidate().await;
                            break;
                        }
                        None => {
                            if !*stop.borrow() {
                                warn!(queue = queue.as_str(), "delivery stream closed, resubscribing");
                                self.channel.invalidate().await;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        previous: u32,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), BinderError> {
        let channel = self.channel.acquire().await?;

        // auto-delete queues vanish with their last consumer
        if previous > 0 && self.pipeline.topology.auto_delete() {
            self.pipeline.provisioner.redeclare(&self.pipeline.topology).await?;
        }

        let deliveries = channel.consume(queue, &self.tag).await?;
        Ok((channel, deliveries))
    }

    async fn handle(&self, channel: &Arc<dyn BrokerChannel>, delivery: Delivery) {
        let tracer = global::tracer(otel::TRACER_NAME);
        let (ctx, mut span) = otel::new_span(
            &delivery.properties.headers,
            &tracer,
            self.pipeline.spec.destination(),
        );

        debug!(
            exchange = delivery.exchange.as_str(),
            routing_key = delivery.routing_key.as_str(),
            redelivered = delivery.redelivered,
            "received message"
        );

        match self.process(&ctx, &delivery).await {
            Ok(()) => match delivery.ack().await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    error!("error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
            },
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                if let Err(err) = self.reject(channel, &delivery, &err).await {
                    error!(error = err.to_string(), "error rejecting msg");
                }
            }
        }
    }

    async fn process(&self, ctx: &Context, delivery: &Delivery) -> Result<(), BinderError> {
        let payload = self.pipeline.compression.decompress(EncodedPayload::new(
            delivery.body.clone(),
            delivery.properties.content_encoding.clone(),
        ))?;

        let value = (self.pipeline.decode)(&payload.body)?;

        let msg = InboundMessage {
            payload: value,
            destination: self.pipeline.spec.destination().to_owned(),
            group: self.pipeline.spec.group().map(str::to_owned),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            properties: MessageProperties {
                content_encoding: payload.content_encoding,
                ..delivery.properties.clone()
            },
        };

        let retry = &self.pipeline.options.retry;
        let mut attempt = 1;

        loop {
            match self.pipeline.handler.exec(ctx, &msg).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        attempt = attempt,
                        error = err.to_string(),
                        delay_ms = delay.as_millis() as u64,
                        "error whiling handling msg, retrying"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reject(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        delivery: &Delivery,
        cause: &BinderError,
    ) -> Result<(), BinderError> {
        let options = &self.pipeline.options;
        let topology = &self.pipeline.topology;

        if options.republish_to_dlq {
            if let (Some(dlx), Some(queue)) = (topology.dlx_name(), topology.queue_name()) {
                error!(error = cause.to_string(), "sending msg to dlq");

                let mut properties = delivery.properties.clone();
                properties.headers.insert(
                    ShortString::from(X_EXCEPTION_MESSAGE),
                    AMQPValue::LongString(LongString::from(cause.to_string())),
                );
                properties.headers.insert(
                    ShortString::from(X_ORIGINAL_EXCHANGE),
                    AMQPValue::LongString(LongString::from(delivery.exchange.clone())),
                );
                properties.headers.insert(
                    ShortString::from(X_ORIGINAL_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(delivery.routing_key.clone())),
                );

                let message = OutboundMessage {
                    body: delivery.body.clone(),
                    properties,
                };

                return match channel.publish(dlx, queue, &message).await {
                    Ok(_) => delivery.ack().await,
                    Err(err) => {
                        error!(error = err.to_string(), "error whiling sending to dlq");
                        delivery.nack(options.requeue_rejected).await?;
                        Err(BinderError::PublishingToDLQError(err.to_string()))
                    }
                };
            }
        }

        warn!(
            error = cause.to_string(),
            requeue = options.requeue_rejected,
            "rejecting msg"
        );
        delivery.nack(options.requeue_rejected).await
    }
}

struct ConsumerInner {
    id: Uuid,
    spec: BindingSpec,
    topology: Topology,
    lifecycle: Arc<Lifecycle>,
    connections: Arc<ConnectionManager>,
    channels: Vec<Arc<ManagedChannel>>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_timeout: Duration,
}

/// Handle of an active consumer binding. Cloning shares the binding.
#[derive(Clone)]
pub struct ConsumerBinding {
    inner: Arc<ConsumerInner>,
}

impl ConsumerBinding {
    /// Starts one worker per channel. The lifecycle must already be `Provisioning`.
    pub(crate) fn start<T: Send + Sync + 'static>(
        pipeline: ConsumerPipeline<T>,
        lifecycle: Lifecycle,
        channels: Vec<ManagedChannel>,
        stop_timeout: Duration,
    ) -> Result<Self, BinderError> {
        let pipeline = Arc::new(pipeline);
        let lifecycle = Arc::new(lifecycle);
        let channels: Vec<Arc<ManagedChannel>> = channels.into_iter().map(Arc::new).collect();
        let (stop, _) = watch::channel(false);

        lifecycle.transition(BindingState::Active)?;

        let workers = channels
            .iter()
            .map(|channel| {
                let worker = Worker {
                    pipeline: pipeline.clone(),
                    lifecycle: lifecycle.clone(),
                    channel: channel.clone(),
                    tag: format!("{}-{}", lifecycle.label(), Uuid::new_v4().simple()),
                };
                tokio::spawn(worker.run(stop.subscribe()))
            })
            .collect();

        info!(
            binding = lifecycle.label(),
            queue = pipeline.topology.queue_name().unwrap_or_default(),
            workers = channels.len(),
            "consumer binding active"
        );

        Ok(ConsumerBinding {
            inner: Arc::new(ConsumerInner {
                id: Uuid::new_v4(),
                spec: pipeline.spec.clone(),
                topology: pipeline.topology.clone(),
                lifecycle,
                connections: pipeline.connections.clone(),
                channels,
                stop,
                workers: Mutex::new(workers),
                stop_timeout,
            }),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Watches the lifecycle state of this binding.
    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.inner.lifecycle.subscribe()
    }

    async fn release(&self) {
        self.inner.stop.send_replace(true);

        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for mut worker in workers {
            if time::timeout(self.inner.stop_timeout, &mut worker).await.is_err() {
                warn!(binding = self.inner.lifecycle.label(), "consumer worker did not stop in time");
                worker.abort();
            }
        }

        for channel in &self.inner.channels {
            if let Err(err) = self.inner.connections.close_channel(channel).await {
                debug!(error = err.to_string(), "consumer channel already closed");
            }
        }
    }
}

#[async_trait]
impl BindingHandle for ConsumerBinding {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn spec(&self) -> &BindingSpec {
        &self.inner.spec
    }

    fn state(&self) -> BindingState {
        self.inner.lifecycle.state()
    }

    async fn unbind(&self) -> Result<(), BinderError> {
        match self.inner.lifecycle.state() {
            BindingState::Stopped => return Ok(()),
            BindingState::Failed => {
                self.release().await;
                return Ok(());
            }
            _ => self.inner.lifecycle.transition(BindingState::Stopping)?,
        }

        self.release().await;

        info!(binding = self.inner.lifecycle.label(), "consumer binding stopped");
        self.inner.lifecycle.transition(BindingState::Stopped)
    }
}
