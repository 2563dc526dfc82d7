// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Bindings
//!
//! A [`ProducerBinding`] publishes to the exchange of its destination over a
//! dedicated outbound channel in publisher-confirm mode. Every send goes through
//! encode, compress and publish; broker nacks are retried per the producer's
//! `publish_retry` before surfacing `PublishRejected`, and a lost connection is
//! recovered by re-acquiring the channel.

use crate::{
    binding::{BindingHandle, BindingSpec, BindingState, Lifecycle},
    broker::{Confirmation, Headers, MessageProperties, OutboundMessage},
    codec::{Codec, JsonCodec, OCTET_STREAM_CONTENT_TYPE},
    compression::{CompressionPipeline, EncodedPayload},
    config::ProducerOptions,
    connection::{ConnectionManager, ConnectionStatus, ManagedChannel},
    errors::BinderError,
    otel,
    topology::{NamingStrategy, Topology},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header carrying the partition a message was routed to.
pub const PARTITION_HEADER: &str = "x-partition";

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Counts publishes in flight and refuses new ones once closed.
pub(crate) struct SendGate {
    closed: AtomicBool,
    in_flight: watch::Sender<usize>,
}

impl SendGate {
    pub(crate) fn new() -> Arc<Self> {
        let (in_flight, _) = watch::channel(0);
        Arc::new(SendGate {
            closed: AtomicBool::new(false),
            in_flight,
        })
    }

    fn enter(self: &Arc<Self>) -> Result<InFlight, BinderError> {
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlight(self.clone());

        if self.closed.load(Ordering::SeqCst) {
            return Err(BinderError::BinderShuttingDown);
        }

        Ok(guard)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits for in-flight publishes to finish; false when `timeout` elapsed first.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        let mut watcher = self.in_flight.subscribe();
        let drained = time::timeout(timeout, watcher.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }
}

struct InFlight(Arc<SendGate>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Partition for `key`, stable across processes.
pub fn partition_for(key: &str, partition_count: u32) -> u32 {
    let hash = key
        .chars()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32));

    hash.unsigned_abs() % partition_count.max(1)
}

pub(crate) struct ProducerParts<C: Codec> {
    pub spec: BindingSpec,
    pub options: ProducerOptions,
    pub topology: Topology,
    pub naming: NamingStrategy,
    pub lifecycle: Lifecycle,
    pub channel: ManagedChannel,
    pub connections: Arc<ConnectionManager>,
    pub codec: Arc<C>,
    pub compression: CompressionPipeline,
    pub gate: Arc<SendGate>,
}

struct ProducerInner<C: Codec> {
    id: Uuid,
    parts: ProducerParts<C>,
    next_partition: AtomicU32,
}

/// Handle of an active producer binding. Cloning shares the binding.
pub struct ProducerBinding<C: Codec = JsonCodec> {
    inner: Arc<ProducerInner<C>>,
}

impl<C: Codec> Clone for ProducerBinding<C> {
    fn clone(&self) -> Self {
        ProducerBinding {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Codec> ProducerBinding<C> {
    pub(crate) fn new(parts: ProducerParts<C>) -> Self {
        ProducerBinding {
            inner: Arc::new(ProducerInner {
                id: Uuid::new_v4(),
                parts,
                next_partition: AtomicU32::new(0),
            }),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.parts.topology
    }

    /// Watches the lifecycle state of this binding.
    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.inner.parts.lifecycle.subscribe()
    }

    /// Encodes `value` with the binder codec and publishes it.
    ///
    /// Partitioned producers spread keyless sends over the partitions in turn.
    pub async fn send<T: Serialize + ?Sized>(&self, ctx: &Context, value: &T) -> Result<(), BinderError> {
        let parts = &self.inner.parts;
        let body = parts.codec.encode(value)?;
        let (routing_key, partition) = self.next_route();

        self.publish(ctx, body, parts.codec.content_type(), &routing_key, partition)
            .await
    }

    /// Publishes `value` routed by `key`: the partition is derived from the key when the
    /// producer is partitioned, otherwise the key is used as the routing key.
    pub async fn send_with_key<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        value: &T,
        key: &str,
    ) -> Result<(), BinderError> {
        let parts = &self.inner.parts;
        let body = parts.codec.encode(value)?;

        let (routing_key, partition) = if parts.options.partition_count > 1 {
            let partition = partition_for(key, parts.options.partition_count);
            (
                parts.naming.producer_routing_key(
                    parts.spec.destination(),
                    &parts.options,
                    Some(partition),
                ),
                Some(partition),
            )
        } else {
            (key.to_owned(), None)
        };

        self.publish(ctx, body, parts.codec.content_type(), &routing_key, partition)
            .await
    }

    /// Publishes `body` without running the codec, routed like [`Self::send`].
    pub async fn send_raw(&self, ctx: &Context, body: Vec<u8>) -> Result<(), BinderError> {
        let (routing_key, partition) = self.next_route();
        self.publish(ctx, body, OCTET_STREAM_CONTENT_TYPE, &routing_key, partition)
            .await
    }

    /// Routing key and partition of the next keyless send.
    fn next_route(&self) -> (String, Option<u32>) {
        let parts = &self.inner.parts;

        let partition = if parts.options.partition_count > 1 {
            Some(self.inner.next_partition.fetch_add(1, Ordering::Relaxed) % parts.options.partition_count)
        } else {
            None
        };

        let routing_key = parts
            .naming
            .producer_routing_key(parts.spec.destination(), &parts.options, partition);

        (routing_key, partition)
    }

    async fn publish(
        &self,
        ctx: &Context,
        body: Vec<u8>,
        content_type: &str,
        routing_key: &str,
        partition: Option<u32>,
    ) -> Result<(), BinderError> {
        let parts = &self.inner.parts;
        let _in_flight = parts.gate.enter()?;
        parts.lifecycle.ensure_active()?;

        let payload = if parts.options.compress {
            parts.compression.compress(EncodedPayload::new(body, None))?
        } else {
            EncodedPayload::new(body, None)
        };

        let mut headers = Headers::new();
        otel::inject(ctx, &mut headers);
        if let Some(partition) = partition {
            headers.insert(ShortString::from(PARTITION_HEADER), AMQPValue::LongUInt(partition));
        }

        let message = OutboundMessage {
            body: payload.body,
            properties: MessageProperties {
                content_type: Some(content_type.to_owned()),
                content_encoding: payload.content_encoding,
                message_id: Some(Uuid::new_v4().to_string()),
                kind: None,
                delivery_mode: Some(if parts.options.persistent {
                    PERSISTENT
                } else {
                    TRANSIENT
                }),
                headers,
            },
        };

        self.publish_with_retry(routing_key, &message).await
    }

    async fn publish_with_retry(&self, routing_key: &str, message: &OutboundMessage) -> Result<(), BinderError> {
        let parts = &self.inner.parts;
        let retry = &parts.options.publish_retry;
        let exchange = parts.topology.exchange_name();
        let mut attempt = 1;

        loop {
            let channel = match parts.channel.acquire().await {
                Ok(channel) => channel,
                Err(err) => {
                    if parts.connections.status() == ConnectionStatus::Failed {
                        parts.lifecycle.fail(&err);
                        return Err(err);
                    }
                    if !err.is_transient() || attempt >= retry.max_attempts {
                        return Err(err);
                    }
                    self.backoff(attempt, &err).await;
                    attempt += 1;
                    continue;
                }
            };

            match channel.publish(exchange, routing_key, message).await {
                Ok(Confirmation::Ack) | Ok(Confirmation::NotRequested) => {
                    debug!(exchange = exchange, routing_key = routing_key, "message published");
                    return Ok(());
                }
                Ok(Confirmation::Nack) => {
                    if attempt >= retry.max_attempts {
                        error!(
                            exchange = exchange,
                            attempts = attempt,
                            "publish rejected by the broker"
                        );
                        return Err(BinderError::PublishRejected(attempt));
                    }
                    self.backoff(attempt, &BinderError::PublishRejected(attempt)).await;
                }
                Err(err) if err.is_transient() => {
                    parts.channel.invalidate().await;
                    if attempt >= retry.max_attempts {
                        error!(error = err.to_string(), "error publishing message");
                        return Err(err);
                    }
                    self.backoff(attempt, &err).await;
                }
                Err(err) => {
                    error!(error = err.to_string(), "error publishing message");
                    return Err(err);
                }
            }

            attempt += 1;
        }
    }

    async fn backoff(&self, attempt: u32, err: &BinderError) {
        let delay = self.inner.parts.options.publish_retry.backoff(attempt);
        warn!(
            binding = self.inner.parts.lifecycle.label(),
            attempt = attempt,
            error = err.to_string(),
            delay_ms = delay.as_millis() as u64,
            "retrying publish"
        );
        time::sleep(delay).await;
    }
}

#[async_trait]
impl<C: Codec> BindingHandle for ProducerBinding<C> {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn spec(&self) -> &BindingSpec {
        &self.inner.parts.spec
    }

    fn state(&self) -> BindingState {
        self.inner.parts.lifecycle.state()
    }

    async fn unbind(&self) -> Result<(), BinderError> {
        let parts = &self.inner.parts;

        match parts.lifecycle.state() {
            BindingState::Stopped => return Ok(()),
            BindingState::Failed => {
                return parts.connections.close_channel(&parts.channel).await;
            }
            _ => parts.lifecycle.transition(BindingState::Stopping)?,
        }

        if let Err(err) = parts.connections.close_channel(&parts.channel).await {
            debug!(error = err.to_string(), "producer channel already closed");
        }

        parts.lifecycle.transition(BindingState::Stopped)
    }
}
