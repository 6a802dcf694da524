//! Shared fixtures for pipeline tests.
//!
//! Everything runs against the bundled in-memory broker.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use courier::bus::{BoxError, InMemoryConfig};
use courier::inbound::{Delivered, HandlerRegistry};
use courier::utils::bootstrap::init_tracing;
use courier::{
    Broker, BusMessage, ConsumerEndpoint, ConsumerHandle, ConsumerState, Envelope, HandlerContext,
    InMemoryBroker, InboundConsumer, MessageHandler, Offset, Producer, ProducerEndpoint,
};

pub const ORDERS: &str = "orders";

static TRACING: Once = Once::new();

/// Install the log subscriber once per test binary.
pub fn tracing() {
    TRACING.call_once(init_tracing);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u32,
    #[serde(default)]
    pub note: String,
}

impl BusMessage for Order {
    fn message_type(&self) -> &str {
        "Order"
    }
}

pub fn order(id: u32) -> Order {
    Order {
        id,
        note: String::new(),
    }
}

/// Order whose payload is large enough to be chunked.
pub fn large_order(id: u32, note_len: usize) -> Order {
    Order {
        id,
        note: "x".repeat(note_len),
    }
}

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub orders: Vec<Order>,
    pub attempt: u32,
    pub at: Instant,
}

/// Records invocations and fails the first `failures` of them.
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    failures: AtomicU32,
}

impl Recorder {
    pub fn healthy() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: AtomicU32::new(failures),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<Vec<u32>> {
        self.calls()
            .into_iter()
            .map(|c| c.orders.iter().map(|o| o.id).collect())
            .collect()
    }

    /// Poll until at least `count` invocations happened.
    pub async fn wait_for_calls(&self, count: usize) -> Vec<Call> {
        for _ in 0..500 {
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls()
    }
}

#[async_trait]
impl MessageHandler<Order> for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, messages: &[&Delivered<Order>], context: &HandlerContext) -> Result<(), BoxError> {
        self.calls.lock().unwrap().push(Call {
            orders: messages.iter().filter_map(|d| d.message().cloned()).collect(),
            attempt: context.attempt(),
            at: Instant::now(),
        });

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(format!("order rejected (attempt {})", context.attempt()).into());
        }
        Ok(())
    }
}

pub async fn connected(config: InMemoryConfig) -> Arc<InMemoryBroker> {
    tracing();
    let broker = Arc::new(InMemoryBroker::new(config));
    broker.connect().await.unwrap();
    broker
}

/// Produce every envelope of `order` to `endpoint`.
pub async fn publish(broker: &InMemoryBroker, endpoint: &str, order: &Order) -> Vec<Offset> {
    let envelopes = ProducerEndpoint::<Order>::new(endpoint).envelopes(order).unwrap();
    produce_all(broker, endpoint, envelopes).await
}

pub async fn produce_all(broker: &InMemoryBroker, endpoint: &str, envelopes: Vec<Envelope>) -> Vec<Offset> {
    let producer = broker.producer(endpoint).await.unwrap();
    let mut offsets = Vec::new();
    for envelope in envelopes {
        offsets.push(producer.produce(envelope).await.unwrap());
    }
    offsets
}

/// Bind and start a consumer, waiting until it listens.
pub async fn start(
    broker: &Arc<InMemoryBroker>,
    endpoint: ConsumerEndpoint<Order>,
    handler: Arc<Recorder>,
) -> ConsumerHandle {
    let registry = HandlerRegistry::<Order>::new().subscribe("Order", handler);
    let mut consumer = InboundConsumer::new(broker.clone(), endpoint, registry);
    consumer.bind().await.unwrap();
    let mut handle = consumer.start().unwrap();
    handle.wait_for(ConsumerState::Listening).await.unwrap();
    handle
}

/// Poll until `count` offsets were acknowledged on `topic`.
pub async fn wait_for_acks(broker: &InMemoryBroker, topic: &str, count: usize) -> Vec<Offset> {
    for _ in 0..500 {
        let offsets = broker.acknowledged(topic).await;
        if offsets.len() >= count {
            return offsets;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    broker.acknowledged(topic).await
}
