//! Mock producer implementation for testing.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, Producer, Result};
use crate::envelope::{Envelope, Offset};

/// Mock producer that records everything it is asked to produce.
pub struct MockProducer {
    endpoint: String,
    produced: RwLock<Vec<Envelope>>,
    fail_on_produce: RwLock<bool>,
    next: AtomicU64,
}

impl MockProducer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            produced: RwLock::new(Vec::new()),
            fail_on_produce: RwLock::new(false),
            next: AtomicU64::new(0),
        }
    }

    pub async fn set_fail_on_produce(&self, fail: bool) {
        *self.fail_on_produce.write().await = fail;
    }

    pub async fn produced_count(&self) -> usize {
        self.produced.read().await.len()
    }

    pub async fn take_produced(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.produced.write().await)
    }
}

#[async_trait]
impl Producer for MockProducer {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn produce(&self, envelope: Envelope) -> Result<Offset> {
        if *self.fail_on_produce.read().await {
            return Err(BusError::Transport("Mock produce failure".to_string()));
        }
        let offset = Offset::position(
            self.endpoint.as_str(),
            self.next.fetch_add(1, Ordering::SeqCst),
        );
        self.produced
            .write()
            .await
            .push(envelope.with_offset(offset.clone()));
        Ok(offset)
    }
}
