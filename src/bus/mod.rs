//! Broker abstraction.
//!
//! This module contains:
//! - `BusError` / `ErrorKind`: the error taxonomy shared by the whole pipeline
//! - `Broker` trait: obtain producers/consumers for an endpoint, connection lifecycle
//! - `Producer` / `Consumer` traits: produce, receive, acknowledge, rollback
//! - Implementations: in-memory broker, mock producer

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Envelope, Offset};

pub mod in_memory;
pub mod mock;

pub use in_memory::{InMemoryBroker, InMemoryConfig};
pub use mock::MockProducer;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Boxed error returned by application code (handlers, validators, ciphers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur anywhere in the message pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: BoxError,
    },

    #[error("Sequence protocol violation in '{sequence}': {message}")]
    SequenceProtocol { sequence: String, message: String },

    #[error("Exactly-once store unavailable: {0}")]
    ExactlyOnceViolation(String),

    #[error("Message validation failed: {0}")]
    Validation(String),

    #[error("No handler subscribed to message type '{0}'")]
    Unhandled(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Consumer for endpoint '{0}' is disconnected")]
    Disconnected(String),

    #[error("Store error: {0}")]
    Store(String),
}

/// Coarse classification of a [`BusError`], used by error policy filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Serialization,
    Handler,
    SequenceProtocol,
    ExactlyOnce,
    Validation,
    Unhandled,
    Configuration,
    Disconnected,
    Store,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Serialization => "serialization",
            Self::Handler => "handler",
            Self::SequenceProtocol => "sequence_protocol",
            Self::ExactlyOnce => "exactly_once",
            Self::Validation => "validation",
            Self::Unhandled => "unhandled",
            Self::Configuration => "configuration",
            Self::Disconnected => "disconnected",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::SequenceProtocol { .. } => ErrorKind::SequenceProtocol,
            Self::ExactlyOnceViolation(_) => ErrorKind::ExactlyOnce,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unhandled(_) => ErrorKind::Unhandled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Default retry classification: only transport failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Errors that must stop the consumer regardless of the configured policies.
    ///
    /// Proceeding without the dedup store risks duplicate processing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExactlyOnceViolation(_) | Self::Configuration(_) | Self::Disconnected(_)
        )
    }

    pub fn handler(name: impl Into<String>, source: BoxError) -> Self {
        Self::Handler {
            handler: name.into(),
            source,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// How a transport expects offsets to be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Each offset is acknowledged independently, in any order (queues).
    #[default]
    Individual,
    /// Acknowledging an offset implicitly acknowledges every earlier offset
    /// of the same stream (logs). The core commits strictly in arrival order.
    Cumulative,
}

/// Producer bound to one endpoint.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Name of the endpoint this producer writes to.
    fn endpoint(&self) -> &str;

    /// Produce an envelope, returning the offset the broker assigned.
    async fn produce(&self, envelope: Envelope) -> Result<Offset>;
}

/// Consumer bound to one endpoint.
///
/// `receive` must be cancel-safe: dropping the future before it resolves must
/// not lose a message.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn endpoint(&self) -> &str;

    fn ack_mode(&self) -> AckMode;

    /// Wait for the next envelope. `Ok(None)` means the stream is closed.
    async fn receive(&self) -> Result<Option<Envelope>>;

    /// Commit a set of offsets.
    async fn acknowledge(&self, offsets: &[Offset]) -> Result<()>;

    /// Release uncommitted offsets so the transport redelivers them.
    async fn rollback(&self, offsets: &[Offset]) -> Result<()>;

    /// Stop receiving. Pending receives resolve with `Ok(None)`.
    async fn close(&self) -> Result<()>;
}

/// Minimal broker contract consumed by the core.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Transport name used in logs and metrics.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn producer(&self, endpoint: &str) -> Result<Arc<dyn Producer>>;

    async fn consumer(&self, endpoint: &str) -> Result<Arc<dyn Consumer>>;
}
