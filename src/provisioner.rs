// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange and Queue Provisioning
//!
//! Turns producer and consumer binding requests into declared broker topology.
//!
//! Declarations for one binding key are single-flight: concurrent requests share a
//! single `OnceCell` and therefore a single round of broker calls. Once a key is
//! provisioned, identical requests are answered from the cache and requests that
//! plan a different topology for the same key fail with `TopologyConflict` before
//! reaching the broker. Anonymous consumer queues are never cached.

use crate::{
    broker::BrokerAdmin,
    config::{ConsumerOptions, ProducerOptions, RetryPolicy},
    errors::BinderError,
    topology::{NamingStrategy, Topology},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::OnceCell, time};
use tracing::{debug, info, warn};

/// Declares exchanges, queues and bindings through a [`BrokerAdmin`].
pub struct ExchangeQueueProvisioner {
    admin: Arc<dyn BrokerAdmin>,
    naming: NamingStrategy,
    retry: RetryPolicy,
    timeout: Duration,
    provisioned: Mutex<HashMap<String, Arc<OnceCell<Topology>>>>,
}

impl ExchangeQueueProvisioner {
    /// # Parameters
    /// * `admin` - Management plane used for declarations
    /// * `naming` - Naming convention for exchanges and queues
    /// * `retry` - Budget for transient declaration failures
    /// * `timeout` - Bound of a single declaration attempt
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        naming: NamingStrategy,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        ExchangeQueueProvisioner {
            admin,
            naming,
            retry,
            timeout,
            provisioned: Mutex::new(HashMap::default()),
        }
    }

    pub fn naming(&self) -> &NamingStrategy {
        &self.naming
    }

    /// Provisions the exchange for a producer, plus the queues of its required groups.
    ///
    /// Required group queues are declared with `group_options`, the consumer options of
    /// the same destination, so a consumer bound later finds the topology it expects.
    /// A partitioned producer gets one queue per partition and group.
    pub async fn provision_producer(
        &self,
        destination: &str,
        options: &ProducerOptions,
        group_options: &ConsumerOptions,
    ) -> Result<Topology, BinderError> {
        let planned = self.naming.plan_producer(destination, options);
        let key = format!("producer:{}", planned.exchange_name());

        let provisioned = self.single_flight(&key, &planned).await?;
        if provisioned.exchange != planned.exchange {
            warn!(
                exchange = planned.exchange_name(),
                "exchange already provisioned with different attributes"
            );
            return Err(BinderError::TopologyConflict(planned.exchange_name().to_owned()));
        }

        let shared = ConsumerOptions {
            exchange_type: options.exchange_type.clone(),
            exchange_durable: options.exchange_durable,
            exchange_auto_delete: options.exchange_auto_delete,
            ..group_options.clone()
        };

        for group in &options.required_groups {
            if options.partition_count > 1 {
                for instance_index in 0..options.partition_count {
                    let partition = ConsumerOptions {
                        partitioned: true,
                        instance_index,
                        ..shared.clone()
                    };
                    self.provision_consumer(destination, Some(group), &partition)
                        .await?;
                }
            } else {
                self.provision_consumer(destination, Some(group), &shared)
                    .await?;
            }
        }

        Ok(planned)
    }

    /// Provisions exchange, queue, binding and optional dead letter pair for a consumer.
    /// `None` as group provisions a fresh anonymous queue.
    pub async fn provision_consumer(
        &self,
        destination: &str,
        group: Option<&str>,
        options: &ConsumerOptions,
    ) -> Result<Topology, BinderError> {
        let planned = self.naming.plan_consumer(destination, group, options);

        if group.is_none() {
            self.declare_with_retry(&planned).await?;
            return Ok(planned);
        }

        let key = format!("consumer:{}", planned.queue_name().unwrap_or_default());
        let provisioned = self.single_flight(&key, &planned).await?;

        if provisioned != planned {
            warn!(
                queue = planned.queue_name().unwrap_or_default(),
                "queue already provisioned with different attributes"
            );
            return Err(BinderError::TopologyConflict(
                planned.queue_name().unwrap_or_default().to_owned(),
            ));
        }

        Ok(provisioned)
    }

    /// Declares `topology` again, bypassing the cache.
    pub async fn redeclare(&self, topology: &Topology) -> Result<(), BinderError> {
        debug!(exchange = topology.exchange_name(), "redeclaring topology");
        self.declare_with_retry(topology).await
    }

    async fn single_flight(&self, key: &str, planned: &Topology) -> Result<Topology, BinderError> {
        let cell = {
            let mut provisioned = self.provisioned.lock();
            provisioned
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(|| async {
            self.declare_with_retry(planned).await?;
            info!(key = key, "topology provisioned");
            Ok::<Topology, BinderError>(planned.clone())
        })
        .await
        .cloned()
    }

    async fn declare_with_retry(&self, topology: &Topology) -> Result<(), BinderError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match time::timeout(self.timeout, self.declare(topology)).await {
                Ok(result) => result,
                Err(_) => Err(BinderError::Timeout(self.timeout.as_millis() as u64)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err @ BinderError::TopologyConflict(_)) => return Err(err),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "provisioning attempt failed, retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempts = attempt,
                        "provisioning failed"
                    );
                    return Err(BinderError::ProvisioningFailed(err.to_string()));
                }
            }
        }
    }

    /// Issues the declarations in dependency order: exchanges, queues, then bindings.
    async fn declare(&self, topology: &Topology) -> Result<(), BinderError> {
        self.admin.declare_exchange(&topology.exchange).await?;

        if let Some(dead_letter) = &topology.dead_letter {
            self.admin.declare_exchange(&dead_letter.exchange).await?;
            self.admin.declare_queue(&dead_letter.queue).await?;
        }

        if let Some(queue) = &topology.queue {
            self.admin.declare_queue(queue).await?;
        }

        if let Some(binding) = topology.dead_letter_binding() {
            self.admin.bind_queue(&binding).await?;
        }

        if let Some(binding) = topology.queue_binding() {
            self.admin.bind_queue(&binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerAdmin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provisioner(admin: MockBrokerAdmin) -> ExchangeQueueProvisioner {
        ExchangeQueueProvisioner::new(
            Arc::new(admin),
            NamingStrategy::default(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(1),
        )
    }

    fn accepting_admin(exchanges: usize, queues: usize, bindings: usize) -> MockBrokerAdmin {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_declare_exchange()
            .times(exchanges)
            .returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .times(queues)
            .returning(|_| Ok(()));
        admin
            .expect_bind_queue()
            .times(bindings)
            .returning(|_| Ok(()));
        admin
    }

    #[tokio::test]
    async fn provisioning_twice_hits_the_broker_once() {
        let provisioner = provisioner(accepting_admin(1, 1, 1));
        let options = ConsumerOptions::default();

        let first = provisioner
            .provision_consumer("orders", Some("billing"), &options)
            .await
            .unwrap();
        let second = provisioner
            .provision_consumer("orders", Some("billing"), &options)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.queue_name(), Some("orders.billing"));
    }

    #[tokio::test]
    async fn conflicting_request_fails_without_broker_call() {
        let provisioner = provisioner(accepting_admin(1, 1, 1));

        provisioner
            .provision_consumer("orders", Some("billing"), &ConsumerOptions::default())
            .await
            .unwrap();

        let err = provisioner
            .provision_consumer(
                "orders",
                Some("billing"),
                &ConsumerOptions {
                    ttl: Some(1_000),
                    ..ConsumerOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err, BinderError::TopologyConflict("orders.billing".to_owned()));
    }

    #[tokio::test]
    async fn broker_conflict_is_surfaced_without_retry() {
        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().times(1).returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .times(1)
            .returning(|def| Err(BinderError::TopologyConflict(def.name().to_owned())));
        admin.expect_bind_queue().never();

        let err = provisioner(admin)
            .provision_consumer("orders", Some("billing"), &ConsumerOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BinderError::TopologyConflict(_)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BinderError::ConnectionLost("reset by peer".to_owned()))
            } else {
                Ok(())
            }
        });

        let topology = provisioner(admin)
            .provision_producer("orders", &ProducerOptions::default(), &ConsumerOptions::default())
            .await
            .unwrap();

        assert_eq!(topology.exchange_name(), "orders");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_provisioning_and_allow_a_later_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(BinderError::ConnectionError("refused".to_owned()))
            } else {
                Ok(())
            }
        });

        let provisioner = provisioner(admin);
        let err = provisioner
            .provision_producer("orders", &ProducerOptions::default(), &ConsumerOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BinderError::ProvisioningFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        provisioner
            .provision_producer("orders", &ProducerOptions::default(), &ConsumerOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_transient_rejection_is_not_retried() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(BinderError::DeclareExchangeError(def.name().to_owned())));

        let err = provisioner(admin)
            .provision_producer("orders", &ProducerOptions::default(), &ConsumerOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BinderError::ProvisioningFailed(_)));
    }

    #[tokio::test]
    async fn dead_letter_pair_is_declared_and_bound() {
        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().times(2).returning(|_| Ok(()));
        admin.expect_declare_queue().times(2).returning(|_| Ok(()));
        admin
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "orders.billing.dlq")
            .times(1)
            .returning(|b| {
                assert_eq!(b.exchange_name(), "DLX");
                assert_eq!(b.key(), "orders.billing");
                Ok(())
            });
        admin
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "orders.billing")
            .times(1)
            .returning(|_| Ok(()));

        let topology = provisioner(admin)
            .provision_consumer(
                "orders",
                Some("billing"),
                &ConsumerOptions {
                    auto_bind_dlq: true,
                    ..ConsumerOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(topology.dlq_name(), Some("orders.billing.dlq"));
    }

    #[tokio::test]
    async fn required_groups_are_provisioned_with_the_producer() {
        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().times(2).returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .withf(|q| q.name() == "orders.audit" && q.is_durable())
            .times(1)
            .returning(|_| Ok(()));
        admin.expect_bind_queue().times(1).returning(|_| Ok(()));

        provisioner(admin)
            .provision_producer(
                "orders",
                &ProducerOptions {
                    required_groups: vec!["audit".to_owned()],
                    ..ProducerOptions::default()
                },
                &ConsumerOptions::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn required_groups_take_the_destination_consumer_options() {
        let provisioner = provisioner(accepting_admin(3, 2, 2));
        let consumer = ConsumerOptions {
            auto_bind_dlq: true,
            ..ConsumerOptions::default()
        };

        provisioner
            .provision_producer(
                "orders",
                &ProducerOptions {
                    required_groups: vec!["audit".to_owned()],
                    ..ProducerOptions::default()
                },
                &consumer,
            )
            .await
            .unwrap();

        let topology = provisioner
            .provision_consumer("orders", Some("audit"), &consumer)
            .await
            .unwrap();

        assert_eq!(topology.dlq_name(), Some("orders.audit.dlq"));
    }

    #[tokio::test]
    async fn partitioned_producers_provision_a_queue_per_partition() {
        let mut admin = MockBrokerAdmin::new();
        admin.expect_declare_exchange().times(3).returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .withf(|q| q.name() == "orders.audit-0")
            .times(1)
            .returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .withf(|q| q.name() == "orders.audit-1")
            .times(1)
            .returning(|_| Ok(()));
        admin
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "orders.audit-0" && b.key() == "orders-0")
            .times(1)
            .returning(|_| Ok(()));
        admin
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "orders.audit-1" && b.key() == "orders-1")
            .times(1)
            .returning(|_| Ok(()));

        provisioner(admin)
            .provision_producer(
                "orders",
                &ProducerOptions {
                    required_groups: vec!["audit".to_owned()],
                    partition_count: 2,
                    ..ProducerOptions::default()
                },
                &ConsumerOptions::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn anonymous_consumers_are_declared_every_time() {
        let provisioner = provisioner(accepting_admin(2, 2, 2));
        let options = ConsumerOptions::default();

        let first = provisioner.provision_consumer("orders", None, &options).await.unwrap();
        let second = provisioner.provision_consumer("orders", None, &options).await.unwrap();

        assert_ne!(first.queue_name(), second.queue_name());
    }
}
