//! Log-style transports: cumulative commits and rewinding rollbacks.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use courier::bus::InMemoryConfig;
use courier::exactly_once::{InMemoryOffsetStore, OffsetStoreStrategy};
use courier::{ConsumerEndpoint, Offset, ProducerEndpoint};

use crate::common::{connected, large_order, order, produce_all, publish, start, wait_for_acks, Order, Recorder, ORDERS};

fn at(position: u64) -> Offset {
    Offset::position("orders[0]", position)
}

#[tokio::test(start_paused = true)]
async fn test_open_chunk_sequence_holds_back_later_commits() {
    let broker = connected(InMemoryConfig::log(1)).await;

    let big = large_order(3, 40);
    let half = serde_json::to_vec(&big).unwrap().len().div_ceil(2);
    let mut chunks = ProducerEndpoint::<Order>::new(ORDERS)
        .with_chunk_size(half)
        .envelopes(&big)
        .unwrap();
    assert_eq!(chunks.len(), 2);
    let tail = chunks.pop().unwrap();

    publish(&broker, ORDERS, &order(1)).await;
    produce_all(&broker, ORDERS, chunks).await;
    publish(&broker, ORDERS, &order(2)).await;

    let handler = Recorder::healthy();
    let endpoint = ConsumerEndpoint::new(ORDERS)
        .with_sequence_timeout(Duration::from_secs(5))
        .with_exactly_once(Arc::new(OffsetStoreStrategy::new(Arc::new(InMemoryOffsetStore::new()))));
    let handle = start(&broker, endpoint, handler.clone()).await;

    handler.wait_for_calls(2).await;
    assert_eq!(handler.ids(), vec![vec![1], vec![2]]);
    // Order 2 is handled but cannot be committed past the open chunk.
    assert_eq!(broker.ack_calls(ORDERS).await, vec![vec![at(0)]]);

    // The chunk sequence times out: the partition rewinds to its first
    // chunk and order 2 is redelivered, then recognized as processed.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(handler.ids(), vec![vec![1], vec![2]]);
    assert_eq!(broker.ack_calls(ORDERS).await, vec![vec![at(0)]]);

    produce_all(&broker, ORDERS, vec![tail]).await;
    handler.wait_for_calls(3).await;
    assert_eq!(handler.ids(), vec![vec![1], vec![2], vec![3]]);
    assert_eq!(handler.calls()[2].orders, vec![big]);

    wait_for_acks(&broker, ORDERS, 4).await;
    assert_eq!(
        broker.ack_calls(ORDERS).await,
        vec![vec![at(0)], vec![at(1), at(2), at(3)]]
    );

    assert_ok!(handle.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_rewinds_open_batch_for_next_consumer() {
    let broker = connected(InMemoryConfig::log(1)).await;
    for id in 1..=3 {
        publish(&broker, ORDERS, &order(id)).await;
    }

    let endpoint = || ConsumerEndpoint::<Order>::new(ORDERS).with_batch(2, Duration::from_secs(30));
    let first = Recorder::healthy();
    let handle = start(&broker, endpoint(), first.clone()).await;

    // [1, 2] dispatches on size, 3 waits in an open batch.
    wait_for_acks(&broker, ORDERS, 2).await;
    assert_ok!(handle.stop().await);
    assert_eq!(first.ids(), vec![vec![1, 2]]);

    let second = Recorder::healthy();
    let handle = start(&broker, endpoint(), second.clone()).await;
    publish(&broker, ORDERS, &order(4)).await;

    let acked = wait_for_acks(&broker, ORDERS, 4).await;
    assert_eq!(acked, vec![at(0), at(1), at(2), at(3)]);
    assert_eq!(second.ids(), vec![vec![3, 4]]);

    assert_ok!(handle.stop().await);
}
