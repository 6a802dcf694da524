//! Courier - broker-agnostic message bus core
//!
//! Sits between application handlers and a message transport and provides
//! ordered batching, reassembly of chunked messages, configurable error
//! policies (retry, skip, move to another endpoint, fatal) and exactly-once
//! consumption backed by an offset store or an inbound log.
//!
//! The transport is abstracted by the [`bus::Broker`], [`bus::Producer`] and
//! [`bus::Consumer`] traits; an in-memory broker is bundled for tests and
//! single-process use.

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error_policy;
pub mod exactly_once;
pub mod inbound;
pub mod outbound;
pub mod sequence;
pub mod serialization;
pub mod utils;

pub use bus::{AckMode, Broker, BusError, Consumer, ErrorKind, InMemoryBroker, Producer, Result};
pub use config::BusConfig;
pub use endpoint::{ConsumerEndpoint, ProducerEndpoint};
pub use envelope::{Envelope, MessageHeaders, Offset};
pub use error_policy::{ErrorPolicyChain, Fatal, Move, Retry, Skip};
pub use inbound::{ConsumerHandle, ConsumerState, HandlerContext, InboundConsumer, MessageHandler};
pub use outbound::{OutboundRouter, RoutingRule};
pub use serialization::BusMessage;
