//! Backoff builders shared across the crate.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker connection attempts at bind time.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff between retries of a failed policy-driven redelivery.
///
/// Jitter is opt-in through `Retry::with_jitter`.
pub fn redelivery_backoff(initial: Duration, factor: f32, max: Duration, attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(initial)
        .with_factor(factor)
        .with_max_delay(max)
        .with_max_times(attempts)
}
