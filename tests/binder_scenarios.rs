// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::future::join_all;
use opentelemetry::Context;
use rabbit_binder::{
    broker::MessageProperties,
    codec::{Codec, JsonCodec},
    compression::{CompressionPipeline, EncodedPayload},
    connection::ConnectionStatus,
    consumer::{InboundMessage, X_EXCEPTION_MESSAGE, X_ORIGINAL_EXCHANGE},
    producer::partition_for,
    BinderBuilder, BinderConfig, BinderError, BindingHandle, BindingOptions, BindingSpec,
    BindingState, ConsumerOptions, InMemoryBroker, ProducerOptions, RabbitMessageChannelBinder,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    total: f64,
}

fn order(id: u64) -> Order {
    Order {
        id,
        total: 9.99,
    }
}

fn config(compression_level: u32) -> BinderConfig {
    BinderConfig {
        compression_level,
        connection_retry: RetryPolicy::new(5, Duration::from_millis(5)),
        provisioning_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        shutdown_timeout_ms: 1_000,
        ..BinderConfig::default()
    }
}

fn binder(broker: &InMemoryBroker, config: BinderConfig) -> RabbitMessageChannelBinder {
    BinderBuilder::new(config)
        .connector(Arc::new(broker.clone()))
        .admin(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

fn consumer_options(options: ConsumerOptions) -> BindingOptions {
    BindingOptions {
        consumer: options,
        ..BindingOptions::default()
    }
}

fn producer_options(options: ProducerOptions) -> BindingOptions {
    BindingOptions {
        producer: options,
        ..BindingOptions::default()
    }
}

async fn recv<T>(rx: &mut mpsc::Receiver<InboundMessage<T>>) -> InboundMessage<T> {
    time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message within 2s")
        .expect("consumer stream closed")
}

async fn drain<T>(rx: &mut mpsc::Receiver<InboundMessage<T>>) -> Vec<T> {
    let mut received = vec![];
    while let Ok(Some(msg)) = time::timeout(Duration::from_millis(100), rx.recv()).await {
        received.push(msg.payload);
    }
    received
}

async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn compressed_orders_reach_the_billing_group() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(6));

    let (provisioned, _) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    assert_eq!(provisioned.topology().exchange_name(), "orders");
    assert_eq!(provisioned.topology().queue_name(), Some("orders.billing"));
    binder.unbind(&provisioned).await.unwrap();

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    assert_eq!(producer.topology().exchange_name(), "orders");
    producer.send(&Context::new(), &order(1)).await.unwrap();

    let wire = broker.messages("orders.billing");
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].properties.content_encoding.as_deref(), Some("gzip"));
    assert_eq!(wire[0].properties.content_type.as_deref(), Some("application/json"));
    assert_ne!(wire[0].body, JsonCodec.encode(&order(1)).unwrap());

    let decompressed = CompressionPipeline::default()
        .decompress(EncodedPayload::new(
            wire[0].body.clone(),
            wire[0].properties.content_encoding.clone(),
        ))
        .unwrap();
    assert_eq!(JsonCodec.decode::<Order>(&decompressed.body).unwrap(), order(1));

    let (_consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();

    let msg = recv(&mut rx).await;
    assert_eq!(msg.payload, order(1));
    assert_eq!(msg.group.as_deref(), Some("billing"));
    assert_eq!(msg.properties.content_encoding, None);

    binder.shutdown().await.unwrap();
}

#[tokio::test]
async fn competing_consumers_share_the_group_queue() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (_a, mut rx_a) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let (_b, mut rx_b) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    wait_until(|| broker.consumer_count("orders.billing") == 2).await;

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    for id in 0..10 {
        producer.send(&Context::new(), &order(id)).await.unwrap();
    }

    let mut from_a = vec![];
    let mut from_b = vec![];
    while from_a.len() + from_b.len() < 10 {
        tokio::select! {
            Some(msg) = rx_a.recv() => from_a.push(msg.payload.id),
            Some(msg) = rx_b.recv() => from_b.push(msg.payload.id),
            _ = time::sleep(Duration::from_secs(2)) => panic!("messages missing"),
        }
    }

    assert!(!from_a.is_empty());
    assert!(!from_b.is_empty());

    let unique: HashSet<u64> = from_a.iter().chain(from_b.iter()).copied().collect();
    assert_eq!(unique.len(), 10);
    assert!(drain(&mut rx_a).await.is_empty());
    assert!(drain(&mut rx_b).await.is_empty());
}

#[tokio::test]
async fn distinct_groups_each_receive_every_message() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (_billing, mut billing) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let (_shipping, mut shipping) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("shipping")))
        .await
        .unwrap();

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    for id in 0..3 {
        producer.send(&Context::new(), &order(id)).await.unwrap();
    }

    for rx in [&mut billing, &mut shipping] {
        let mut ids = vec![];
        for _ in 0..3 {
            ids.push(recv(rx).await.payload.id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn anonymous_consumers_get_private_queues() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (first, mut rx_first) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", None))
        .await
        .unwrap();
    let (second, mut rx_second) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", None))
        .await
        .unwrap();

    let first_queue = first.topology().queue_name().unwrap().to_owned();
    assert!(first_queue.starts_with("orders.anonymous."));
    assert_ne!(Some(first_queue.as_str()), second.topology().queue_name());
    assert!(first.topology().auto_delete());

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    producer.send(&Context::new(), &order(7)).await.unwrap();

    assert_eq!(recv(&mut rx_first).await.payload, order(7));
    assert_eq!(recv(&mut rx_second).await.payload, order(7));
}

#[tokio::test]
async fn bindings_resume_after_the_connection_drops() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(6));

    let (consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    producer.send(&Context::new(), &order(1)).await.unwrap();
    assert_eq!(recv(&mut rx).await.payload, order(1));

    broker.sever_connections();

    producer.send(&Context::new(), &order(2)).await.unwrap();

    // at-least-once: the first message may come back if its ack raced the drop
    loop {
        let msg = recv(&mut rx).await;
        if msg.payload == order(2) {
            break;
        }
        assert!(msg.redelivered);
    }

    assert_eq!(consumer.state(), BindingState::Active);
    assert_eq!(producer.state(), BindingState::Active);
    assert_eq!(binder.connection_status(), ConnectionStatus::Connected);
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test]
async fn anonymous_queues_are_redeclared_after_reconnection() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", None))
        .await
        .unwrap();
    let queue = consumer.topology().queue_name().unwrap().to_owned();
    wait_until(|| broker.consumer_count(&queue) == 1).await;

    broker.sever_connections();
    assert!(!broker.has_queue(&queue));

    wait_until(|| broker.consumer_count(&queue) == 1).await;

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    producer.send(&Context::new(), &order(3)).await.unwrap();

    assert_eq!(recv(&mut rx).await.payload, order(3));
}

#[tokio::test]
async fn concurrent_binds_provision_once() {
    let broker = InMemoryBroker::new();
    broker.set_admin_latency(Duration::from_millis(20));
    let binder = Arc::new(binder(&broker, config(0)));

    let binds = (0..5).map(|_| {
        let binder = binder.clone();
        async move {
            binder
                .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
                .await
        }
    });

    for result in join_all(binds).await {
        assert!(result.is_ok());
    }

    assert_eq!(broker.exchange_declarations(), 1);
    assert_eq!(broker.admin_calls(), 3);
    assert_eq!(broker.bound_queues("orders"), vec!["orders.billing".to_owned()]);
}

#[tokio::test]
async fn transient_admin_failures_are_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_next_admin_calls(2);
    let binder = binder(&broker, config(0));

    binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    assert!(broker.has_exchange("orders"));
}

#[tokio::test]
async fn unreachable_admin_fails_the_bind_only() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    broker.fail_next_admin_calls(10);
    let err = binder
        .bind_producer(BindingSpec::producer("orders"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BinderError::ProvisioningFailed(_)));

    broker.fail_next_admin_calls(0);
    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    assert_eq!(producer.state(), BindingState::Active);
}

#[tokio::test]
async fn conflicting_topology_is_rejected() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    let transient = producer_options(ProducerOptions {
        exchange_durable: false,
        ..ProducerOptions::default()
    });
    let err = binder
        .bind_producer(BindingSpec::producer("orders").with_options(transient))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BinderError::TopologyConflict(_)));
}

#[tokio::test]
async fn broker_nacks_surface_as_rejected_sends() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let options = producer_options(ProducerOptions {
        publish_retry: RetryPolicy::new(2, Duration::from_millis(1)),
        ..ProducerOptions::default()
    });
    let producer = binder
        .bind_producer(BindingSpec::producer("orders").with_options(options))
        .await
        .unwrap();

    broker.nack_next_publishes(1);
    producer.send(&Context::new(), &order(1)).await.unwrap();

    broker.nack_next_publishes(5);
    let err = producer.send(&Context::new(), &order(2)).await.unwrap_err();
    assert_eq!(err, BinderError::PublishRejected(2));

    assert_eq!(producer.state(), BindingState::Active);
}

#[tokio::test]
async fn undecodable_messages_go_to_the_dlq_without_stopping_the_consumer() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let options = consumer_options(ConsumerOptions {
        auto_bind_dlq: true,
        republish_to_dlq: true,
        retry: RetryPolicy::new(1, Duration::from_millis(1)),
        ..ConsumerOptions::default()
    });
    let (consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(
            BindingSpec::consumer("orders", Some("billing")).with_options(options),
        )
        .await
        .unwrap();
    assert_eq!(consumer.topology().dlq_name(), Some("orders.billing.dlq"));

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    producer
        .send_raw(&Context::new(), b"not an order".to_vec())
        .await
        .unwrap();
    producer.send(&Context::new(), &order(2)).await.unwrap();

    assert_eq!(recv(&mut rx).await.payload, order(2));

    let dead = broker.messages("orders.billing.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"not an order".to_vec());
    assert_eq!(dead[0].properties.header_str(X_ORIGINAL_EXCHANGE), Some("orders"));
    assert!(dead[0].properties.header_str(X_EXCEPTION_MESSAGE).is_some());
    assert_eq!(consumer.state(), BindingState::Active);
}

#[tokio::test]
async fn raw_consumers_receive_untouched_bytes() {
    struct Collect(mpsc::UnboundedSender<(Vec<u8>, MessageProperties)>);

    #[async_trait::async_trait]
    impl rabbit_binder::ConsumerHandler<Vec<u8>> for Collect {
        async fn exec(&self, _ctx: &Context, msg: &InboundMessage<Vec<u8>>) -> Result<(), BinderError> {
            self.0
                .send((msg.payload.clone(), msg.properties.clone()))
                .map_err(|err| BinderError::ConsumerError(err.to_string()))
        }
    }

    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(9));
    let (tx, mut rx) = mpsc::unbounded_channel();

    binder
        .bind_raw_consumer(BindingSpec::consumer("blobs", Some("archive")), Arc::new(Collect(tx)))
        .await
        .unwrap();
    let producer = binder.bind_producer(BindingSpec::producer("blobs")).await.unwrap();

    producer.send_raw(&Context::new(), vec![0, 159, 146, 150]).await.unwrap();

    let (body, properties) = time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, vec![0, 159, 146, 150]);
    assert_eq!(properties.content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(properties.delivery_mode, Some(2));
    assert!(properties.message_id.is_some());
}

#[tokio::test]
async fn required_groups_retain_messages_before_consumers_bind() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let options = producer_options(ProducerOptions {
        required_groups: vec!["audit".to_owned()],
        ..ProducerOptions::default()
    });
    let producer = binder
        .bind_producer(BindingSpec::producer("orders").with_options(options))
        .await
        .unwrap();

    producer.send(&Context::new(), &order(5)).await.unwrap();
    assert_eq!(broker.messages("orders.audit").len(), 1);

    let (_audit, mut rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("audit")))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.payload, order(5));
}

#[tokio::test]
async fn partitioned_producers_route_by_key() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let mut receivers = vec![];
    for instance_index in 0..2 {
        let options = consumer_options(ConsumerOptions {
            partitioned: true,
            instance_index,
            ..ConsumerOptions::default()
        });
        let (consumer, rx) = binder
            .bind_consumer_stream::<Order>(
                BindingSpec::consumer("orders", Some("billing")).with_options(options),
            )
            .await
            .unwrap();
        assert_eq!(
            consumer.topology().queue_name(),
            Some(format!("orders.billing-{}", instance_index).as_str())
        );
        receivers.push(rx);
    }

    let options = producer_options(ProducerOptions {
        partition_count: 2,
        ..ProducerOptions::default()
    });
    let producer = binder
        .bind_producer(BindingSpec::producer("orders").with_options(options))
        .await
        .unwrap();

    let keys = ["customer-1", "customer-2", "customer-3", "customer-4"];
    for (id, key) in keys.iter().enumerate() {
        producer
            .send_with_key(&Context::new(), &order(id as u64), key)
            .await
            .unwrap();
    }

    let mut expected: Vec<Vec<u64>> = vec![vec![], vec![]];
    for (id, key) in keys.iter().enumerate() {
        expected[partition_for(key, 2) as usize].push(id as u64);
    }

    for (partition, rx) in receivers.iter_mut().enumerate() {
        let ids: Vec<u64> = drain(rx).await.into_iter().map(|o| o.id).collect();
        assert_eq!(ids, expected[partition]);
    }
}

#[tokio::test]
async fn required_groups_share_the_destination_consumer_options() {
    let broker = InMemoryBroker::new();
    let mut config = config(0);
    config.bindings.insert(
        "orders".to_owned(),
        BindingOptions {
            producer: ProducerOptions {
                required_groups: vec!["audit".to_owned()],
                ..ProducerOptions::default()
            },
            consumer: ConsumerOptions {
                auto_bind_dlq: true,
                ..ConsumerOptions::default()
            },
        },
    );
    let binder = binder(&broker, config);

    binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    assert!(broker.has_queue("orders.audit.dlq"));

    let (consumer, _rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("audit")))
        .await
        .unwrap();

    assert_eq!(consumer.state(), BindingState::Active);
    assert_eq!(consumer.topology().dlq_name(), Some("orders.audit.dlq"));
}

#[tokio::test]
async fn raw_sends_rotate_over_the_partitions() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let options = producer_options(ProducerOptions {
        required_groups: vec!["billing".to_owned()],
        partition_count: 2,
        ..ProducerOptions::default()
    });
    let producer = binder
        .bind_producer(BindingSpec::producer("orders").with_options(options))
        .await
        .unwrap();

    producer.send_raw(&Context::new(), b"first".to_vec()).await.unwrap();
    producer.send_raw(&Context::new(), b"second".to_vec()).await.unwrap();

    let first = broker.messages("orders.billing-0");
    let second = broker.messages("orders.billing-1");
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].body, b"first".to_vec());
    assert_eq!(second[0].body, b"second".to_vec());
}

#[tokio::test]
async fn each_provisioning_attempt_is_bounded_by_the_timeout() {
    let broker = InMemoryBroker::new();
    broker.set_admin_latency(Duration::from_millis(200));
    let binder = binder(
        &broker,
        BinderConfig {
            provisioning_timeout_ms: 20,
            ..config(0)
        },
    );

    let err = binder
        .bind_producer(BindingSpec::producer("orders"))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BinderError::ProvisioningFailed(_)));
    assert!(!broker.has_exchange("orders"));

    broker.set_admin_latency(Duration::ZERO);
    binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
}

#[tokio::test]
async fn concurrent_consumers_deliver_each_message_once() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let options = consumer_options(ConsumerOptions {
        concurrency: 3,
        ..ConsumerOptions::default()
    });
    let (_consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(
            BindingSpec::consumer("orders", Some("billing")).with_options(options),
        )
        .await
        .unwrap();
    wait_until(|| broker.consumer_count("orders.billing") == 3).await;

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    for id in 0..9 {
        producer.send(&Context::new(), &order(id)).await.unwrap();
    }

    let mut ids = vec![];
    for _ in 0..9 {
        ids.push(recv(&mut rx).await.payload.id);
    }
    ids.sort_unstable();

    assert_eq!(ids, (0..9).collect::<Vec<u64>>());
    assert!(drain(&mut rx).await.is_empty());
    assert!(broker.messages("orders.billing").is_empty());
}

#[tokio::test]
async fn a_failed_consumer_channel_does_not_reconnect_other_bindings() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (_consumer, mut rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();
    wait_until(|| broker.consumer_count("orders.billing") == 1).await;

    assert_eq!(broker.close_consumer_channels("orders.billing"), 1);
    producer.send(&Context::new(), &order(8)).await.unwrap();

    wait_until(|| broker.consumer_count("orders.billing") == 1).await;
    assert_eq!(recv(&mut rx).await.payload, order(8));
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(binder.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn unbind_keeps_topology_and_rejects_further_sends() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (consumer, _rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    binder.unbind(&consumer).await.unwrap();
    binder.unbind(&producer).await.unwrap();

    assert_eq!(consumer.state(), BindingState::Stopped);
    assert_eq!(producer.state(), BindingState::Stopped);
    assert!(broker.has_exchange("orders"));
    assert!(broker.has_queue("orders.billing"));
    assert_eq!(broker.bound_queues("orders"), vec!["orders.billing".to_owned()]);

    assert!(matches!(
        producer.send(&Context::new(), &order(1)).await,
        Err(BinderError::BindingNotActive(_))
    ));
    assert!(producer.unbind().await.is_ok());
    assert!(binder.health().await.bindings.is_empty());
}

#[tokio::test]
async fn specs_must_match_the_bind_operation() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let err = binder
        .bind_producer(BindingSpec::consumer("orders", Some("billing")))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BinderError::InvalidBindingSpec(_)));

    let err = binder
        .bind_consumer_stream::<Order>(BindingSpec::producer("orders"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BinderError::InvalidBindingSpec(_)));
}

#[tokio::test]
async fn exhausted_reconnection_fails_the_binding() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    broker.set_available(false);
    broker.sever_connections();

    let err = producer.send(&Context::new(), &order(1)).await.unwrap_err();
    assert!(matches!(err, BinderError::ConnectionLost(_)));
    assert_eq!(producer.state(), BindingState::Failed);

    let health = binder.health().await;
    assert_eq!(health.connection, ConnectionStatus::Failed);
    assert!(!health.is_healthy());
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let broker = InMemoryBroker::new();
    let binder = binder(&broker, config(0));

    let (consumer, _rx) = binder
        .bind_consumer_stream::<Order>(BindingSpec::consumer("orders", Some("billing")))
        .await
        .unwrap();
    let producer = binder.bind_producer(BindingSpec::producer("orders")).await.unwrap();

    let health = binder.health().await;
    assert!(health.is_healthy());
    assert_eq!(health.bindings.len(), 2);
    assert_eq!(health.endpoint.as_deref(), Some("localhost:5672"));

    binder.shutdown().await.unwrap();

    assert_eq!(consumer.state(), BindingState::Stopped);
    assert_eq!(producer.state(), BindingState::Stopped);
    assert_eq!(binder.connection_status(), ConnectionStatus::Closed);
    assert_eq!(
        producer.send(&Context::new(), &order(1)).await,
        Err(BinderError::BinderShuttingDown)
    );
    assert!(matches!(
        binder.bind_producer(BindingSpec::producer("orders")).await,
        Err(BinderError::BinderShuttingDown)
    ));
    assert!(binder.shutdown().await.is_ok());
}
