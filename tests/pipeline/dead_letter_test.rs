//! Failures resolved by moving messages to a dead letter endpoint.

use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use courier::bus::InMemoryConfig;
use courier::envelope::{
    FAILED_ATTEMPTS_HEADER, FAILURE_KIND_HEADER, FAILURE_REASON_HEADER, SOURCE_ENDPOINT_HEADER,
    SOURCE_OFFSET_HEADER,
};
use courier::{Broker, BusError, ConsumerEndpoint, ConsumerState, ErrorKind, ErrorPolicyChain, Move, Retry};

use crate::common::{connected, order, publish, start, wait_for_acks, Recorder, ORDERS};

const DLQ: &str = "orders.dlq";

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_move_message_to_dead_letter_endpoint() {
    let broker = connected(InMemoryConfig::queue()).await;
    let original = publish(&broker, ORDERS, &order(7)).await;

    let chain = ErrorPolicyChain::new()
        .then(Retry::attempts(2).with_initial_delay(Duration::from_millis(100)))
        .then(Move::to(broker.producer(DLQ).await.unwrap()));
    let handler = Recorder::failing(u32::MAX);
    let handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_error_policy(chain),
        handler.clone(),
    )
    .await;

    let acked = wait_for_acks(&broker, ORDERS, 1).await;
    assert_eq!(acked, original);

    let calls = handler.calls();
    assert_eq!(calls.iter().map(|c| c.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert!(calls[1].at - calls[0].at >= Duration::from_millis(100));

    let moved = broker.messages(DLQ).await;
    assert_eq!(moved.len(), 1);
    let headers = moved[0].headers();
    assert_eq!(headers.get(FAILED_ATTEMPTS_HEADER), Some("2"));
    assert_eq!(headers.get(FAILURE_KIND_HEADER), Some(ErrorKind::Handler.as_str()));
    assert!(headers.get(FAILURE_REASON_HEADER).is_some_and(|r| r.contains("order rejected")));
    assert_eq!(headers.get(SOURCE_ENDPOINT_HEADER), Some(ORDERS));
    let source = original[0].to_string();
    assert_eq!(headers.get(SOURCE_OFFSET_HEADER), Some(source.as_str()));

    assert_ok!(handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_endpoint_is_consumable() {
    let broker = connected(InMemoryConfig::queue()).await;
    publish(&broker, ORDERS, &order(3)).await;

    let chain = ErrorPolicyChain::new().then(Move::to(broker.producer(DLQ).await.unwrap()));
    let failing = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_error_policy(chain),
        Recorder::failing(u32::MAX),
    )
    .await;
    wait_for_acks(&broker, ORDERS, 1).await;
    assert_ok!(failing.stop().await);

    let inspector = Recorder::healthy();
    let handle = start(&broker, ConsumerEndpoint::new(DLQ), inspector.clone()).await;

    let acked = wait_for_acks(&broker, DLQ, 1).await;
    assert_eq!(acked.len(), 1);
    assert_eq!(inspector.ids(), vec![vec![3]]);

    assert_ok!(handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_move_disconnects_and_redelivers_on_restart() {
    let broker = connected(InMemoryConfig::queue()).await;
    broker.fail_next_produce(DLQ, 1).await;

    let chain = ErrorPolicyChain::new().then(Move::to(broker.producer(DLQ).await.unwrap()));
    let mut handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_error_policy(chain),
        Recorder::failing(u32::MAX),
    )
    .await;
    publish(&broker, ORDERS, &order(5)).await;

    assert_ok!(handle.wait_for(ConsumerState::Disconnected).await);
    assert!(matches!(assert_err!(handle.join().await), BusError::Transport(_)));
    assert!(broker.acknowledged(ORDERS).await.is_empty());
    assert!(broker.messages(DLQ).await.is_empty());

    let recovered = Recorder::healthy();
    let handle = start(&broker, ConsumerEndpoint::new(ORDERS), recovered.clone()).await;
    wait_for_acks(&broker, ORDERS, 1).await;
    assert_eq!(recovered.ids(), vec![vec![5]]);

    assert_ok!(handle.stop().await);
}
