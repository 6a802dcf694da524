//! Outbound routing into running consumers, and endpoints built from configuration.

use std::sync::Arc;

use tokio_test::assert_ok;

use courier::bus::InMemoryConfig;
use courier::inbound::HandlerRegistry;
use courier::{BusConfig, ConsumerEndpoint, ConsumerState, InboundConsumer, OutboundRouter, ProducerEndpoint, RoutingRule};

use crate::common::{connected, order, start, wait_for_acks, Order, Recorder, ORDERS};

const AUDIT: &str = "audit";

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_every_consumer() {
    let broker = connected(InMemoryConfig::queue()).await;
    let router = OutboundRouter::new(broker.clone())
        .register_endpoint(ProducerEndpoint::<Order>::new(ORDERS))
        .register_endpoint(ProducerEndpoint::<Order>::new(AUDIT))
        .route("Order", RoutingRule::broadcast([ORDERS, AUDIT]));
    assert_ok!(router.preload().await);

    let orders = Recorder::healthy();
    let audit = Recorder::healthy();
    let orders_handle = start(&broker, ConsumerEndpoint::new(ORDERS), orders.clone()).await;
    let audit_handle = start(&broker, ConsumerEndpoint::new(AUDIT), audit.clone()).await;

    let report = router.publish(&order(11)).await.unwrap();
    assert!(report.is_complete_success());

    wait_for_acks(&broker, ORDERS, 1).await;
    wait_for_acks(&broker, AUDIT, 1).await;
    assert_eq!(orders.ids(), vec![vec![11]]);
    assert_eq!(audit.ids(), vec![vec![11]]);

    assert_ok!(orders_handle.stop().await);
    assert_ok!(audit_handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_partial_broadcast_failure_leaves_other_target_delivered() {
    let broker = connected(InMemoryConfig::queue()).await;
    broker.fail_next_produce(AUDIT, 1).await;
    let router = OutboundRouter::new(broker.clone())
        .register_endpoint(ProducerEndpoint::<Order>::new(ORDERS))
        .register_endpoint(ProducerEndpoint::<Order>::new(AUDIT))
        .route("Order", RoutingRule::broadcast([ORDERS, AUDIT]));

    let orders = Recorder::healthy();
    let handle = start(&broker, ConsumerEndpoint::new(ORDERS), orders.clone()).await;

    let report = router.publish(&order(12)).await.unwrap();
    assert!(!report.is_complete_success());
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].0, AUDIT);

    wait_for_acks(&broker, ORDERS, 1).await;
    assert_eq!(orders.ids(), vec![vec![12]]);
    assert!(broker.messages(AUDIT).await.is_empty());

    assert_ok!(handle.stop().await);
}

const CONFIG: &str = r#"
broker:
  partitions: 2
endpoints:
  - name: orders
    batch_size: 2
    batch_max_wait_ms: 60000
    exactly_once:
      kind: inbound_log
    error_policies:
      - type: retry
        attempts: 2
        initial_delay_ms: 50
      - type: move
        target: orders.dlq
"#;

#[tokio::test(start_paused = true)]
async fn test_configured_endpoint_batches_and_recovers() {
    let config = BusConfig::from_yaml_str(CONFIG).unwrap();
    let broker = Arc::new(config.broker.in_memory_broker());
    let settings = config.endpoint(ORDERS).unwrap();

    let endpoint = settings.build_consumer::<Order>(broker.as_ref(), None).await.unwrap();
    let producer = settings.build_producer::<Order>(None).unwrap();
    let router = OutboundRouter::new(broker.clone())
        .register_endpoint(producer)
        .route("Order", RoutingRule::to(ORDERS));

    let handler = Recorder::failing(1);
    let registry = HandlerRegistry::<Order>::new().subscribe("Order", handler.clone());
    let mut consumer = InboundConsumer::new(broker.clone(), endpoint, registry);
    // Binding connects the broker.
    assert_ok!(consumer.bind().await);
    let mut handle = assert_ok!(consumer.start());
    assert_ok!(handle.wait_for(ConsumerState::Listening).await);

    router.publish(&order(1)).await.unwrap();
    router.publish(&order(2)).await.unwrap();

    let acked = wait_for_acks(&broker, ORDERS, 2).await;
    assert_eq!(acked.len(), 2);
    let calls = handler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls.iter().map(|c| c.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(calls[1].orders.len(), 2);
    assert!(broker.messages("orders.dlq").await.is_empty());

    assert_ok!(handle.stop().await);
}
