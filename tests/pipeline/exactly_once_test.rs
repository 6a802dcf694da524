//! Deduplication that survives consumer restarts.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_test::assert_ok;

use courier::bus::InMemoryConfig;
use courier::exactly_once::{FileInboundLog, FileOffsetStore, InboundLogStrategy, OffsetStoreStrategy};
use courier::ConsumerEndpoint;

use crate::common::{connected, order, produce_all, publish, start, wait_for_acks, Recorder, ORDERS};

#[tokio::test]
async fn test_offset_store_skips_replayed_positions_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offsets.json");

    let first_broker = connected(InMemoryConfig::queue()).await;
    publish(&first_broker, ORDERS, &order(1)).await;
    publish(&first_broker, ORDERS, &order(2)).await;

    let store = Arc::new(FileOffsetStore::open(&path).await.unwrap());
    let handler = Recorder::healthy();
    let handle = start(
        &first_broker,
        ConsumerEndpoint::new(ORDERS).with_exactly_once(Arc::new(OffsetStoreStrategy::new(store))),
        handler.clone(),
    )
    .await;
    wait_for_acks(&first_broker, ORDERS, 2).await;
    assert_ok!(handle.stop().await);
    assert_eq!(handler.ids(), vec![vec![1], vec![2]]);

    // A transport that lost its commits replays the same positions.
    let replay = connected(InMemoryConfig::queue()).await;
    produce_all(&replay, ORDERS, first_broker.messages(ORDERS).await).await;
    publish(&replay, ORDERS, &order(3)).await;

    let reopened = Arc::new(FileOffsetStore::open(&path).await.unwrap());
    let handler = Recorder::healthy();
    let handle = start(
        &replay,
        ConsumerEndpoint::new(ORDERS).with_exactly_once(Arc::new(OffsetStoreStrategy::new(reopened))),
        handler.clone(),
    )
    .await;

    let acked = wait_for_acks(&replay, ORDERS, 3).await;
    assert_eq!(acked.len(), 3);
    assert_eq!(handler.wait_for_calls(1).await.len(), 1);
    assert_eq!(handler.ids(), vec![vec![3]]);

    assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn test_inbound_log_skips_republished_message_ids() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inbound.json");
    let broker = connected(InMemoryConfig::queue()).await;
    publish(&broker, ORDERS, &order(1)).await;

    let log = Arc::new(FileInboundLog::open(&path).await.unwrap());
    let handler = Recorder::healthy();
    let handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_exactly_once(Arc::new(InboundLogStrategy::new(log))),
        handler.clone(),
    )
    .await;
    wait_for_acks(&broker, ORDERS, 1).await;
    assert_ok!(handle.stop().await);

    // Same message id produced again at a new offset.
    let delivered = broker.messages(ORDERS).await;
    produce_all(&broker, ORDERS, delivered).await;
    publish(&broker, ORDERS, &order(2)).await;

    let reopened = Arc::new(FileInboundLog::open(&path).await.unwrap());
    let restarted = Recorder::healthy();
    let handle = start(
        &broker,
        ConsumerEndpoint::new(ORDERS).with_exactly_once(Arc::new(InboundLogStrategy::new(reopened))),
        restarted.clone(),
    )
    .await;

    let acked = wait_for_acks(&broker, ORDERS, 3).await;
    assert_eq!(acked.len(), 3);
    assert_eq!(restarted.ids(), vec![vec![2]]);

    assert_ok!(handle.stop().await);
}
