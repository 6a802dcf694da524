//! Exactly-once processing.
//!
//! A strategy answers "was this envelope already processed?" before dispatch
//! and records the answer right before the broker acknowledgment. Two
//! strategies are provided:
//!
//! - [`OffsetStoreStrategy`]: skip anything at or before the last stored
//!   position of its stream. Cheap; needs ordered offsets.
//! - [`InboundLogStrategy`]: remember every processed message id. For
//!   transports without reliable ordering.
//!
//! Store failures surface as [`BusError::ExactlyOnceViolation`], which the
//! consumer treats as fatal.

mod stores;

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{BusError, Result};
use crate::envelope::Envelope;

pub use stores::{FileInboundLog, FileOffsetStore, InMemoryInboundLog, InMemoryOffsetStore};

/// Deduplication protocol consulted by the inbound consumer.
#[async_trait]
pub trait ExactlyOnceStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `envelope` was already processed.
    async fn has_been_processed(&self, envelope: &Envelope) -> Result<bool>;

    /// Record `envelopes` as processed. Called once per unit, right before
    /// the broker acknowledgment.
    async fn mark_processed(&self, envelopes: &[Envelope]) -> Result<()>;
}

/// Durable last-position store, keyed by endpoint and stream.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn last_position(&self, endpoint: &str, stream: &str) -> Result<Option<u64>>;

    /// Store positions; lower positions than the stored one are ignored.
    async fn store(&self, endpoint: &str, positions: &[(String, u64)]) -> Result<()>;
}

/// Durable processed-message-id log, keyed by endpoint.
#[async_trait]
pub trait InboundLog: Send + Sync {
    async fn contains(&self, endpoint: &str, message_id: &str) -> Result<bool>;

    async fn add(&self, endpoint: &str, message_ids: &[String]) -> Result<()>;
}

fn violation(e: BusError) -> BusError {
    match e {
        BusError::ExactlyOnceViolation(_) => e,
        other => BusError::ExactlyOnceViolation(other.to_string()),
    }
}

// ============================================================================
// Offset store strategy
// ============================================================================

/// Skip envelopes whose every offset is at or before the stored position.
///
/// Token offsets carry no order and are never considered processed.
pub struct OffsetStoreStrategy {
    store: Arc<dyn OffsetStore>,
}

impl OffsetStoreStrategy {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExactlyOnceStrategy for OffsetStoreStrategy {
    fn name(&self) -> &str {
        "offset_store"
    }

    async fn has_been_processed(&self, envelope: &Envelope) -> Result<bool> {
        let offsets = envelope.offsets();
        if offsets.is_empty() {
            return Ok(false);
        }
        for offset in &offsets {
            let Some(position) = offset.as_position() else {
                return Ok(false);
            };
            let last = self
                .store
                .last_position(envelope.endpoint(), offset.stream())
                .await
                .map_err(violation)?;
            if last.map_or(true, |last| position > last) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn mark_processed(&self, envelopes: &[Envelope]) -> Result<()> {
        let Some(endpoint) = envelopes.first().map(Envelope::endpoint) else {
            return Ok(());
        };
        let positions: Vec<(String, u64)> = envelopes
            .iter()
            .flat_map(Envelope::offsets)
            .filter_map(|o| o.as_position().map(|p| (o.stream().to_string(), p)))
            .collect();
        if positions.is_empty() {
            return Ok(());
        }
        self.store.store(endpoint, &positions).await.map_err(violation)
    }
}

// ============================================================================
// Inbound log strategy
// ============================================================================

/// Skip envelopes whose message id was already logged.
///
/// Envelopes without `x-message-id` fall back to their offset string.
pub struct InboundLogStrategy {
    log: Arc<dyn InboundLog>,
}

impl InboundLogStrategy {
    pub fn new(log: Arc<dyn InboundLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ExactlyOnceStrategy for InboundLogStrategy {
    fn name(&self) -> &str {
        "inbound_log"
    }

    async fn has_been_processed(&self, envelope: &Envelope) -> Result<bool> {
        self.log
            .contains(envelope.endpoint(), &envelope.identity())
            .await
            .map_err(violation)
    }

    async fn mark_processed(&self, envelopes: &[Envelope]) -> Result<()> {
        let Some(endpoint) = envelopes.first().map(Envelope::endpoint) else {
            return Ok(());
        };
        let ids: Vec<String> = envelopes.iter().map(Envelope::identity).collect();
        self.log.add(endpoint, &ids).await.map_err(violation)
    }
}
