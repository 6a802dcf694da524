use serde::{Deserialize, Serialize};

use super::*;
use crate::bus::InMemoryBroker;
use crate::envelope::{CHUNK_COUNT_HEADER, MESSAGE_KEY_HEADER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shipment {
    region: String,
    weight: u32,
}

impl BusMessage for Shipment {
    fn message_type(&self) -> &str {
        "Shipment"
    }
}

fn shipment(region: &str) -> Shipment {
    Shipment {
        region: region.into(),
        weight: 12,
    }
}

async fn broker() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::queue());
    broker.connect().await.unwrap();
    broker
}

fn router(broker: &Arc<InMemoryBroker>) -> OutboundRouter<Shipment> {
    OutboundRouter::new(broker.clone())
        .register_endpoint(ProducerEndpoint::new("warehouse"))
        .register_endpoint(ProducerEndpoint::new("billing"))
}

#[tokio::test]
async fn test_static_route_to_single_endpoint() {
    let broker = broker().await;
    let router = router(&broker).route("Shipment", RoutingRule::to("warehouse"));

    let report = router.publish(&shipment("eu")).await.unwrap();

    assert!(report.is_complete_success());
    assert_eq!(report.offsets("warehouse"), Some(&[Offset::position("warehouse[0]", 0)][..]));
    assert_eq!(broker.messages("warehouse").await.len(), 1);
    assert!(broker.messages("billing").await.is_empty());
}

#[tokio::test]
async fn test_broadcast_reports_partial_failure() {
    let broker = broker().await;
    broker.fail_next_produce("billing", 1).await;
    let router = router(&broker).route("Shipment", RoutingRule::broadcast(["warehouse", "billing"]));

    let report = router.publish(&shipment("eu")).await.unwrap();

    assert!(!report.is_complete_success());
    assert_eq!(report.outcomes.len(), 2);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "billing");
    assert!(matches!(failures[0].1, BusError::Transport(_)));
    assert!(report.offsets("warehouse").is_some());
    assert_eq!(broker.messages("warehouse").await.len(), 1);
    assert!(broker.messages("billing").await.is_empty());
}

#[tokio::test]
async fn test_dynamic_route_uses_message_content() {
    let broker = broker().await;
    let router = router(&broker).route(
        "Shipment",
        RoutingRule::dynamic(|s: &Shipment| {
            if s.region == "us" {
                vec!["warehouse".to_string(), "billing".to_string(), "warehouse".to_string()]
            } else {
                vec!["warehouse".to_string()]
            }
        }),
    );

    let report = router.publish(&shipment("us")).await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    router.publish(&shipment("eu")).await.unwrap();

    assert_eq!(broker.messages("warehouse").await.len(), 2);
    assert_eq!(broker.messages("billing").await.len(), 1);
}

#[tokio::test]
async fn test_unrouted_message_type_is_an_error() {
    let broker = broker().await;
    let router = router(&broker);

    assert!(matches!(
        router.publish(&shipment("eu")).await,
        Err(BusError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_unregistered_dynamic_target_fails_only_that_target() {
    let broker = broker().await;
    let router = router(&broker).route(
        "Shipment",
        RoutingRule::dynamic(|_: &Shipment| vec!["warehouse".to_string(), "archive".to_string()]),
    );

    let report = router.publish(&shipment("eu")).await.unwrap();

    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "archive");
    assert!(report.offsets("warehouse").is_some());
}

#[tokio::test]
async fn test_preload_rejects_unregistered_static_target() {
    let broker = broker().await;
    let router = router(&broker).route("Shipment", RoutingRule::to("archive"));

    assert!(matches!(router.preload().await, Err(BusError::Configuration(_))));
}

#[tokio::test]
async fn test_preload_instantiates_producers() {
    let broker = broker().await;
    let router = router(&broker).route("Shipment", RoutingRule::to("warehouse"));

    router.preload().await.unwrap();
    assert_eq!(router.producers.read().await.len(), 2);
}

#[tokio::test]
async fn test_chunked_endpoint_produces_every_chunk_in_order() {
    let broker = broker().await;
    let router = OutboundRouter::new(broker.clone())
        .register_endpoint(
            ProducerEndpoint::<Shipment>::new("warehouse")
                .with_chunk_size(8)
                .with_message_key(|s: &Shipment| Some(s.region.clone())),
        )
        .route("Shipment", RoutingRule::to("warehouse"));

    let report = router.publish(&shipment("eu")).await.unwrap();

    let offsets = report.offsets("warehouse").unwrap();
    assert!(offsets.len() > 1);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    let produced = broker.messages("warehouse").await;
    assert_eq!(produced.len(), offsets.len());
    assert!(produced.iter().all(|e| e.headers().get(MESSAGE_KEY_HEADER) == Some("eu")));
    let expected = offsets.len().to_string();
    assert!(produced
        .iter()
        .all(|e| e.headers().get(CHUNK_COUNT_HEADER) == Some(expected.as_str())));
}
