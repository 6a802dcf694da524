//! Shared utilities: tracing bootstrap, backoff builders and metrics.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
