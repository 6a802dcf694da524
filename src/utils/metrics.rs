//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("courier"));

// ============================================================================
// Inbound
// ============================================================================

/// Duration of one dispatch unit, handlers and commit included.
pub static INBOUND_DISPATCH_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("courier.inbound.dispatch.duration")
        .with_description("Inbound dispatch duration")
        .with_unit("s")
        .build()
});

/// Total dispatch units resolved, by outcome.
pub static INBOUND_PROCESSED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.inbound.processed.total")
        .with_description("Total inbound dispatch units resolved")
        .build()
});

/// Total messages dropped as already processed.
pub static INBOUND_DUPLICATE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.inbound.duplicate.total")
        .with_description("Total inbound duplicates skipped")
        .build()
});

// ============================================================================
// Error handling
// ============================================================================

/// Total error policy verdicts.
pub static ERROR_POLICY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.error_policy.total")
        .with_description("Total error policy verdicts")
        .build()
});

/// Total sequences aborted by protocol violations or timeouts.
pub static SEQUENCE_ABORTED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.sequence.aborted.total")
        .with_description("Total aborted sequences")
        .build()
});

// ============================================================================
// Outbound
// ============================================================================

/// Total publish attempts per target endpoint.
pub static OUTBOUND_PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.outbound.publish.total")
        .with_description("Total outbound publish operations")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create an endpoint label.
pub fn endpoint_attr(endpoint: &str) -> KeyValue {
    KeyValue::new("endpoint", endpoint.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create a policy verdict label.
pub fn verdict_attr(verdict: &str) -> KeyValue {
    KeyValue::new("verdict", verdict.to_string())
}

/// Create an error kind label.
pub fn error_kind_attr(kind: &str) -> KeyValue {
    KeyValue::new("error_kind", kind.to_string())
}
