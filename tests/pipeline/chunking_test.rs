//! Chunked messages: reassembly, inactivity timeout and protocol violations.

use std::time::Duration;

use tokio_test::assert_ok;

use courier::bus::InMemoryConfig;
use courier::envelope::{CHUNK_ID_HEADER, FAILURE_KIND_HEADER};
use courier::{Broker, ConsumerEndpoint, ErrorKind, ErrorPolicyChain, Move, OutboundRouter, ProducerEndpoint, RoutingRule};

use crate::common::{connected, large_order, produce_all, start, wait_for_acks, Order, Recorder, ORDERS};

#[tokio::test(start_paused = true)]
async fn test_chunked_publish_is_handled_once_reassembled() {
    let broker = connected(InMemoryConfig::queue()).await;
    let router = OutboundRouter::new(broker.clone())
        .register_endpoint(ProducerEndpoint::<Order>::new(ORDERS).with_chunk_size(16))
        .route("Order", RoutingRule::to(ORDERS));
    let big = large_order(9, 100);

    let report = router.publish(&big).await.unwrap();
    let produced = report.offsets(ORDERS).unwrap().to_vec();
    assert!(produced.len() > 1);

    let handler = Recorder::healthy();
    let handle = start(&broker, ConsumerEndpoint::new(ORDERS), handler.clone()).await;

    let acked = wait_for_acks(&broker, ORDERS, produced.len()).await;
    assert_eq!(acked, produced);
    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].orders, vec![big]);

    assert_ok!(handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_chunk_sequence_is_redelivered() {
    let broker = connected(InMemoryConfig::queue()).await;
    let big = large_order(4, 60);
    let mut chunks = ProducerEndpoint::<Order>::new(ORDERS)
        .with_chunk_size(16)
        .envelopes(&big)
        .unwrap();
    let last = chunks.pop().unwrap();
    produce_all(&broker, ORDERS, chunks).await;

    let handler = Recorder::healthy();
    let handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_sequence_timeout(Duration::from_secs(5)),
        handler.clone(),
    )
    .await;

    // Past the inactivity timeout: the partial sequence was rolled back and
    // its chunks redelivered into a fresh sequence.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(handler.calls().is_empty());
    assert!(broker.acknowledged(ORDERS).await.is_empty());

    produce_all(&broker, ORDERS, vec![last]).await;
    let calls = handler.wait_for_calls(1).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].orders, vec![big]);

    let total = broker.messages(ORDERS).await.len();
    assert_eq!(wait_for_acks(&broker, ORDERS, total).await.len(), total);

    assert_ok!(handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_chunk_is_moved_by_policy() {
    let broker = connected(InMemoryConfig::queue()).await;
    let chunks = ProducerEndpoint::<Order>::new(ORDERS)
        .with_chunk_size(16)
        .envelopes(&large_order(2, 60))
        .unwrap();
    let chunk_id = chunks[1].headers().get(CHUNK_ID_HEADER).unwrap().to_string();
    // The sequence starts at chunk 1.
    produce_all(&broker, ORDERS, vec![chunks[1].clone()]).await;

    let dlq = broker.producer("orders.dlq").await.unwrap();
    let handler = Recorder::healthy();
    let handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_error_policy(ErrorPolicyChain::new().then(Move::to(dlq))),
        handler.clone(),
    )
    .await;

    assert_eq!(wait_for_acks(&broker, ORDERS, 1).await.len(), 1);
    assert!(handler.calls().is_empty());

    let moved = broker.messages("orders.dlq").await;
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].headers().get(CHUNK_ID_HEADER), Some(chunk_id.as_str()));
    assert_eq!(
        moved[0].headers().get(FAILURE_KIND_HEADER),
        Some(ErrorKind::SequenceProtocol.as_str())
    );

    assert_ok!(handle.stop().await);
}
