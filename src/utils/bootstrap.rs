//! Process bootstrap helpers.
//!
//! Shared initialization for applications embedding the bus.

use std::future::Future;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set. Panics if a global
/// subscriber is already installed.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a broker with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "in-memory", "consumer")
/// * `address` - What is being connected to, for logging
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection result on success, or the last error once the backoff is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, address: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let connected = connect
        .retry(connection_backoff())
        .notify(|e: &E, delay| {
            warn!(
                service = %service_name,
                address = %address,
                error = %e,
                "Connection failed, retrying in {:?}",
                delay
            );
        })
        .await?;
    info!(service = %service_name, address = %address, "Connected");
    Ok(connected)
}
