//! Commit/rollback hooks around each dispatch unit.
//!
//! The consumer begins a transaction per unit, hands it to handlers through
//! [`HandlerContext`](super::HandlerContext), commits it right before the
//! broker acknowledgment and rolls it back on any failure.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::Result;

/// One unit of work spanning every handler of a dispatch.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn id(&self) -> &str;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Access to the concrete transaction for handlers that know its type.
    fn as_any(&self) -> &dyn Any;
}

/// Begins transactions for a consumer.
#[async_trait]
pub trait TransactionFactory: Send + Sync {
    async fn begin(&self, endpoint: &str) -> Result<Arc<dyn Transaction>>;
}
