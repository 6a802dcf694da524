use super::*;
use crate::envelope::{MessageHeaders, MESSAGE_KEY_HEADER};

fn envelope(topic: &str, payload: &str) -> Envelope {
    Envelope::outbound(topic, MessageHeaders::new(), Some(payload.as_bytes().to_vec()))
}

async fn connected(config: InMemoryConfig) -> InMemoryBroker {
    let broker = InMemoryBroker::new(config);
    broker.connect().await.unwrap();
    broker
}

#[tokio::test]
async fn test_produce_assigns_increasing_offsets() {
    let broker = connected(InMemoryConfig::queue()).await;
    let producer = broker.producer("orders").await.unwrap();

    let first = producer.produce(envelope("orders", "a")).await.unwrap();
    let second = producer.produce(envelope("orders", "b")).await.unwrap();

    assert_eq!(first, Offset::position("orders[0]", 0));
    assert_eq!(second, Offset::position("orders[0]", 1));
    assert!(first < second);
    assert_eq!(broker.messages("orders").await.len(), 2);
}

#[tokio::test]
async fn test_consumer_requires_connection() {
    let broker = InMemoryBroker::queue();
    assert!(matches!(
        broker.consumer("orders").await,
        Err(BusError::Transport(_))
    ));
}

#[tokio::test]
async fn test_receive_delivers_in_order() {
    let broker = connected(InMemoryConfig::queue()).await;
    let producer = broker.producer("orders").await.unwrap();
    let consumer = broker.consumer("orders").await.unwrap();

    producer.produce(envelope("orders", "a")).await.unwrap();
    producer.produce(envelope("orders", "b")).await.unwrap();

    let a = consumer.receive().await.unwrap().unwrap();
    let b = consumer.receive().await.unwrap().unwrap();
    assert_eq!(a.payload(), Some(&b"a"[..]));
    assert_eq!(b.payload(), Some(&b"b"[..]));
}

#[tokio::test]
async fn test_receive_waits_for_production() {
    let broker = Arc::new(connected(InMemoryConfig::queue()).await);
    let consumer = broker.consumer("orders").await.unwrap();

    let waiter = tokio::spawn(async move { consumer.receive().await });
    tokio::task::yield_now().await;

    let producer = broker.producer("orders").await.unwrap();
    producer.produce(envelope("orders", "late")).await.unwrap();

    let received = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(received.payload(), Some(&b"late"[..]));
}

#[tokio::test]
async fn test_individual_rollback_requeues_at_front() {
    let broker = connected(InMemoryConfig::queue()).await;
    let producer = broker.producer("orders").await.unwrap();
    let consumer = broker.consumer("orders").await.unwrap();

    producer.produce(envelope("orders", "a")).await.unwrap();
    producer.produce(envelope("orders", "b")).await.unwrap();

    let a = consumer.receive().await.unwrap().unwrap();
    consumer.rollback(&a.offsets()).await.unwrap();

    let again = consumer.receive().await.unwrap().unwrap();
    assert_eq!(again.offset(), a.offset());
    let b = consumer.receive().await.unwrap().unwrap();
    assert_eq!(b.payload(), Some(&b"b"[..]));
}

#[tokio::test]
async fn test_unacknowledged_messages_redelivered_after_restart() {
    let broker = connected(InMemoryConfig::queue()).await;
    let producer = broker.producer("orders").await.unwrap();
    for p in ["a", "b", "c"] {
        producer.produce(envelope("orders", p)).await.unwrap();
    }

    let consumer = broker.consumer("orders").await.unwrap();
    let a = consumer.receive().await.unwrap().unwrap();
    let _b = consumer.receive().await.unwrap().unwrap();
    consumer.acknowledge(&a.offsets()).await.unwrap();
    consumer.close().await.unwrap();

    let restarted = broker.consumer("orders").await.unwrap();
    let first = restarted.receive().await.unwrap().unwrap();
    assert_eq!(first.payload(), Some(&b"b"[..]));
}

#[tokio::test]
async fn test_cumulative_rollback_seeks_back() {
    let broker = connected(InMemoryConfig::log(1)).await;
    let producer = broker.producer("events").await.unwrap();
    for p in ["a", "b", "c"] {
        producer.produce(envelope("events", p)).await.unwrap();
    }

    let consumer = broker.consumer("events").await.unwrap();
    assert_eq!(consumer.ack_mode(), AckMode::Cumulative);
    let a = consumer.receive().await.unwrap().unwrap();
    let b = consumer.receive().await.unwrap().unwrap();
    let _c = consumer.receive().await.unwrap().unwrap();
    consumer.acknowledge(&a.offsets()).await.unwrap();
    consumer.rollback(&b.offsets()).await.unwrap();

    let replay_b = consumer.receive().await.unwrap().unwrap();
    let replay_c = consumer.receive().await.unwrap().unwrap();
    assert_eq!(replay_b.payload(), Some(&b"b"[..]));
    assert_eq!(replay_c.payload(), Some(&b"c"[..]));
}

#[tokio::test]
async fn test_message_key_selects_stable_partition() {
    let broker = connected(InMemoryConfig::log(4)).await;
    let producer = broker.producer("events").await.unwrap();
    let keyed = |p: &str| {
        Envelope::outbound(
            "events",
            MessageHeaders::new().with(MESSAGE_KEY_HEADER, "customer-7"),
            Some(p.as_bytes().to_vec()),
        )
    };

    let first = producer.produce(keyed("a")).await.unwrap();
    let second = producer.produce(keyed("b")).await.unwrap();
    assert_eq!(first.stream(), second.stream());
    assert!(first < second);
}

#[tokio::test]
async fn test_zero_partitions_treated_as_one() {
    let broker = connected(InMemoryConfig {
        partitions: 0,
        ack_mode: AckMode::Individual,
    })
    .await;
    let producer = broker.producer("events").await.unwrap();

    let plain = producer.produce(envelope("events", "a")).await.unwrap();
    let keyed = producer
        .produce(Envelope::outbound(
            "events",
            MessageHeaders::new().with(MESSAGE_KEY_HEADER, "customer-7"),
            Some(b"b".to_vec()),
        ))
        .await
        .unwrap();
    assert_eq!(plain, Offset::position("events[0]", 0));
    assert_eq!(keyed, Offset::position("events[0]", 1));
}

#[tokio::test]
async fn test_injected_faults() {
    let broker = connected(InMemoryConfig::queue()).await;
    let producer = broker.producer("orders").await.unwrap();

    broker.fail_next_produce("orders", 1).await;
    assert!(producer.produce(envelope("orders", "a")).await.is_err());
    assert!(producer.produce(envelope("orders", "a")).await.is_ok());

    let consumer = broker.consumer("orders").await.unwrap();
    let a = consumer.receive().await.unwrap().unwrap();
    broker.fail_next_ack("orders", 1).await;
    assert!(consumer.acknowledge(&a.offsets()).await.is_err());
    assert!(consumer.acknowledge(&a.offsets()).await.is_ok());
    assert_eq!(broker.ack_calls("orders").await.len(), 1);
}

#[tokio::test]
async fn test_close_resolves_pending_receive() {
    let broker = connected(InMemoryConfig::queue()).await;
    let consumer = broker.consumer("orders").await.unwrap();
    let waiting = Arc::clone(&consumer);

    let handle = tokio::spawn(async move { waiting.receive().await });
    tokio::task::yield_now().await;
    consumer.close().await.unwrap();

    assert!(handle.await.unwrap().unwrap().is_none());
}
