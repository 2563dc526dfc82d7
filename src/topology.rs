// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Topology
//!
//! A [`Topology`] is the broker-side shape of one binding: the exchange backing the
//! destination and, for consumers, the queue bound to it together with its dead
//! letter pair. Topologies are planned deterministically from the destination,
//! group and options, so two requests for the same binding always plan the same
//! topology (anonymous queues excepted, they carry a random suffix).

use crate::{
    config::{ConsumerOptions, ProducerOptions},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use uuid::Uuid;

/// Name of the dead letter exchange, after the prefix.
pub const DEAD_LETTER_EXCHANGE: &str = "DLX";
/// Suffix appended to a queue name to build its dead letter queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";
/// Infix used for anonymous consumer queues.
pub const ANONYMOUS_INFIX: &str = ".anonymous.";

/// Broker objects backing a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) routing_key: String,
    pub(crate) dead_letter: Option<DeadLetter>,
}

/// Dead letter exchange and queue for a consumer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) routing_key: String,
}

impl Topology {
    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        self.exchange.exchange_kind()
    }

    /// The consumer queue; `None` for producers.
    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(|q| q.name())
    }

    /// Publish routing key for producers, binding key for consumers.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn durable(&self) -> bool {
        match &self.queue {
            Some(q) => q.is_durable(),
            None => self.exchange.is_durable(),
        }
    }

    pub fn auto_delete(&self) -> bool {
        match &self.queue {
            Some(q) => q.is_auto_delete(),
            None => self.exchange.is_auto_delete(),
        }
    }

    pub fn exclusive(&self) -> bool {
        self.queue.as_ref().map(|q| q.is_exclusive()).unwrap_or_default()
    }

    pub fn dlx_name(&self) -> Option<&str> {
        self.dead_letter.as_ref().map(|d| d.exchange.name())
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dead_letter.as_ref().map(|d| d.queue.name())
    }

    pub fn exchange_definition(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue_definition(&self) -> Option<&QueueDefinition> {
        self.queue.as_ref()
    }

    /// The queue-to-exchange binding, for consumers.
    pub fn queue_binding(&self) -> Option<QueueBinding> {
        self.queue.as_ref().map(|q| {
            QueueBinding::new(q.name())
                .exchange(self.exchange.name())
                .routing_key(&self.routing_key)
        })
    }

    pub(crate) fn dead_letter_binding(&self) -> Option<QueueBinding> {
        self.dead_letter.as_ref().map(|d| {
            QueueBinding::new(d.queue.name())
                .exchange(d.exchange.name())
                .routing_key(&d.routing_key)
        })
    }
}

/// Derives broker object names from destinations and groups.
#[derive(Debug, Clone, Default)]
pub struct NamingStrategy {
    prefix: String,
}

impl NamingStrategy {
    pub fn new(prefix: &str) -> Self {
        NamingStrategy {
            prefix: prefix.to_owned(),
        }
    }

    pub fn exchange_name(&self, destination: &str) -> String {
        format!("{}{}", self.prefix, destination)
    }

    /// `{prefix}{destination}.{group}`, suffixed with the instance index when partitioned.
    pub fn group_queue_name(&self, destination: &str, group: &str, options: &ConsumerOptions) -> String {
        let name = format!("{}{}.{}", self.prefix, destination, group);
        if options.partitioned {
            format!("{}-{}", name, options.instance_index)
        } else {
            name
        }
    }

    pub fn anonymous_queue_name(&self, destination: &str) -> String {
        format!(
            "{}{}{}{}",
            self.prefix,
            destination,
            ANONYMOUS_INFIX,
            Uuid::new_v4().simple()
        )
    }

    pub fn dead_letter_exchange_name(&self) -> String {
        format!("{}{}", self.prefix, DEAD_LETTER_EXCHANGE)
    }

    pub fn dead_letter_queue_name(&self, queue: &str) -> String {
        format!("{}{}", queue, DEAD_LETTER_QUEUE_SUFFIX)
    }

    /// Publish routing key for a producer and an optional partition.
    pub fn producer_routing_key(
        &self,
        destination: &str,
        options: &ProducerOptions,
        partition: Option<u32>,
    ) -> String {
        let base = options
            .routing_key
            .clone()
            .unwrap_or_else(|| destination.to_owned());

        match partition {
            Some(p) => format!("{}-{}", base, p),
            None => base,
        }
    }

    pub fn consumer_binding_key(&self, destination: &str, options: &ConsumerOptions) -> String {
        if options.partitioned {
            format!("{}-{}", destination, options.instance_index)
        } else {
            options.binding_routing_key.clone()
        }
    }

    /// Plans the producer topology: the destination exchange only.
    pub fn plan_producer(&self, destination: &str, options: &ProducerOptions) -> Topology {
        let mut exchange =
            ExchangeDefinition::new(&self.exchange_name(destination)).kind(options.exchange_type.clone());
        if options.exchange_durable {
            exchange = exchange.durable();
        }
        if options.exchange_auto_delete {
            exchange = exchange.delete();
        }

        Topology {
            exchange,
            queue: None,
            routing_key: self.producer_routing_key(destination, options, None),
            dead_letter: None,
        }
    }

    /// Plans the consumer topology. A `None` group yields an anonymous queue.
    pub fn plan_consumer(
        &self,
        destination: &str,
        group: Option<&str>,
        options: &ConsumerOptions,
    ) -> Topology {
        let mut exchange =
            ExchangeDefinition::new(&self.exchange_name(destination)).kind(options.exchange_type.clone());
        if options.exchange_durable {
            exchange = exchange.durable();
        }
        if options.exchange_auto_delete {
            exchange = exchange.delete();
        }

        let mut queue = match group {
            Some(group) => {
                let queue = QueueDefinition::new(&self.group_queue_name(destination, group, options));
                if options.durable_subscription {
                    queue.durable()
                } else {
                    queue
                }
            }
            // declared over the admin connection, so not exclusive
            None => QueueDefinition::new(&self.anonymous_queue_name(destination)).delete(),
        };

        if let Some(ttl) = options.ttl {
            queue = queue.ttl(ttl);
        }
        if let Some(max) = options.max_length {
            queue = queue.max_length(max);
        }
        if let Some(max_bytes) = options.max_length_bytes {
            queue = queue.max_length_bytes(max_bytes);
        }

        let dead_letter = if options.auto_bind_dlq {
            let dlx = self.dead_letter_exchange_name();
            let dlq = QueueDefinition::new(&self.dead_letter_queue_name(queue.name())).durable();
            let routing_key = queue.name().to_owned();
            queue = queue.dead_letter(&dlx, &routing_key);

            Some(DeadLetter {
                exchange: ExchangeDefinition::new(&dlx).direct().durable(),
                queue: dlq,
                routing_key,
            })
        } else {
            None
        };

        Topology {
            exchange,
            queue: Some(queue),
            routing_key: self.consumer_binding_key(destination, options),
            dead_letter,
        }
    }
}
