//! Error policy chain.
//!
//! An ordered list of recovery rules evaluated against a failure and its
//! [`RetryContext`]. The first policy whose `can_handle` returns true decides
//! the outcome. When none matches, transport errors are retried with the
//! connection backoff; anything else escalates and disconnects the consumer.
//!
//! Policies:
//! - [`Retry`]: redeliver up to N attempts with exponential backoff
//! - [`Skip`]: commit without handling again
//! - [`Move`]: republish to another endpoint with failure headers, then commit
//! - [`Fatal`]: stop the consumer

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, ErrorKind, Producer, Result};
use crate::envelope::{
    Envelope, MessageHeaders, Offset, BATCH_ID_HEADER, FAILED_ATTEMPTS_HEADER, FAILURE_KIND_HEADER,
    FAILURE_REASON_HEADER, FIRST_FAILED_AT_HEADER, SOURCE_ENDPOINT_HEADER, SOURCE_OFFSET_HEADER,
};
use crate::utils::retry::{connection_backoff, redelivery_backoff};

// ============================================================================
// Retry context
// ============================================================================

/// Failure bookkeeping for one logical message (or sequence).
#[derive(Debug, Clone)]
pub struct RetryContext {
    identity: String,
    failed_attempts: u32,
    last_error: String,
    last_kind: ErrorKind,
    cumulative_backoff: Duration,
    first_failure_at: DateTime<Utc>,
}

impl RetryContext {
    fn first(identity: &str, error: &BusError) -> Self {
        Self {
            identity: identity.to_string(),
            failed_attempts: 1,
            last_error: error.to_string(),
            last_kind: error.kind(),
            cumulative_backoff: Duration::ZERO,
            first_failure_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Failed attempts so far, including the one being evaluated.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn last_kind(&self) -> ErrorKind {
        self.last_kind
    }

    pub fn cumulative_backoff(&self) -> Duration {
        self.cumulative_backoff
    }

    pub fn first_failure_at(&self) -> DateTime<Utc> {
        self.first_failure_at
    }
}

/// Retry contexts keyed by message identity.
///
/// Survives repeated failures of the same logical message and is cleared once
/// the message is resolved (committed, skipped or moved).
#[derive(Default)]
pub struct RetryContextStore {
    contexts: Mutex<HashMap<String, RetryContext>>,
}

impl RetryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the updated context.
    pub async fn record_failure(&self, identity: &str, error: &BusError) -> RetryContext {
        let mut contexts = self.contexts.lock().await;
        let context = contexts
            .entry(identity.to_string())
            .and_modify(|ctx| {
                ctx.failed_attempts += 1;
                ctx.last_error = error.to_string();
                ctx.last_kind = error.kind();
            })
            .or_insert_with(|| RetryContext::first(identity, error));
        context.clone()
    }

    pub async fn add_backoff(&self, identity: &str, delay: Duration) {
        if let Some(ctx) = self.contexts.lock().await.get_mut(identity) {
            ctx.cumulative_backoff += delay;
        }
    }

    pub async fn get(&self, identity: &str) -> Option<RetryContext> {
        self.contexts.lock().await.get(identity).cloned()
    }

    pub async fn clear(&self, identity: &str) {
        self.contexts.lock().await.remove(identity);
    }

    pub async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.lock().await.is_empty()
    }
}

// ============================================================================
// Policy contract
// ============================================================================

/// Outcome decided by a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Redeliver the same unit after the delay.
    Retry(Duration),
    /// Commit the offsets without handling again.
    Skip,
    /// Republished to `endpoint`; commit the original offsets.
    Moved { endpoint: String, offsets: Vec<Offset> },
    /// Roll back and disconnect.
    Fatal,
}

impl PolicyVerdict {
    /// Whether the original offsets get committed.
    pub fn commits(&self) -> bool {
        matches!(self, Self::Skip | Self::Moved { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry(_) => "retry",
            Self::Skip => "skip",
            Self::Moved { .. } => "move",
            Self::Fatal => "fatal",
        }
    }
}

/// Failure being evaluated by the chain.
pub struct Failure<'a> {
    pub error: &'a BusError,
    pub context: &'a RetryContext,
    /// Envelopes of the failed unit, in arrival order.
    pub envelopes: &'a [Envelope],
    /// Endpoint the unit arrived on.
    pub endpoint: &'a str,
}

/// One recovery rule.
#[async_trait]
pub trait ErrorPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, error: &BusError, context: &RetryContext) -> bool;

    async fn apply(&self, failure: &Failure<'_>) -> Result<PolicyVerdict>;
}

type ErrorPredicate = Arc<dyn Fn(&BusError, &RetryContext) -> bool + Send + Sync>;

/// Filter options shared by every policy.
#[derive(Clone, Default)]
pub struct PolicyFilter {
    max_failed_attempts: Option<u32>,
    apply_to: Vec<ErrorKind>,
    exclude: Vec<ErrorKind>,
    predicate: Option<ErrorPredicate>,
}

impl PolicyFilter {
    pub fn matches(&self, error: &BusError, context: &RetryContext) -> bool {
        if let Some(max) = self.max_failed_attempts {
            if context.failed_attempts() > max {
                return false;
            }
        }
        let kind = error.kind();
        if !self.apply_to.is_empty() && !self.apply_to.contains(&kind) {
            return false;
        }
        if self.exclude.contains(&kind) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(error, context),
            None => true,
        }
    }
}

impl fmt::Debug for PolicyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyFilter")
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("apply_to", &self.apply_to)
            .field("exclude", &self.exclude)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Builder methods for the shared filter options.
macro_rules! filter_builders {
    ($ty:ty) => {
        impl $ty {
            /// Only apply while the failed attempts are at most `max`.
            pub fn max_failed_attempts(mut self, max: u32) -> Self {
                self.filter.max_failed_attempts = Some(max);
                self
            }

            /// Only apply to these error kinds.
            pub fn apply_to(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
                self.filter.apply_to.extend(kinds);
                self
            }

            /// Never apply to these error kinds.
            pub fn exclude(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
                self.filter.exclude.extend(kinds);
                self
            }

            /// Only apply when `predicate` holds.
            pub fn apply_when(
                mut self,
                predicate: impl Fn(&BusError, &RetryContext) -> bool + Send + Sync + 'static,
            ) -> Self {
                self.filter.predicate = Some(Arc::new(predicate));
                self
            }
        }
    };
}

// ============================================================================
// Retry
// ============================================================================

/// Redeliver the failed unit up to `attempts` handler invocations in total,
/// waiting an exponentially growing delay between them.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: u32,
    initial_delay: Duration,
    factor: f32,
    max_delay: Duration,
    jitter: bool,
    filter: PolicyFilter,
}

impl Retry {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
            filter: PolicyFilter::default(),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f32) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = redelivery_backoff(
            self.initial_delay,
            self.factor,
            self.max_delay,
            self.attempts as usize,
        );
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Delay before the redelivery following the `failed_attempts`-th failure.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let index = failed_attempts.saturating_sub(1) as usize;
        self.backoff()
            .build()
            .nth(index)
            .unwrap_or(self.max_delay)
    }
}

filter_builders!(Retry);

#[async_trait]
impl ErrorPolicy for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    fn can_handle(&self, error: &BusError, context: &RetryContext) -> bool {
        context.failed_attempts() < self.attempts && self.filter.matches(error, context)
    }

    async fn apply(&self, failure: &Failure<'_>) -> Result<PolicyVerdict> {
        let delay = self.delay_for(failure.context.failed_attempts());
        info!(
            endpoint = %failure.endpoint,
            identity = %failure.context.identity(),
            attempt = failure.context.failed_attempts(),
            max_attempts = self.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure.error,
            "Retrying failed message"
        );
        Ok(PolicyVerdict::Retry(delay))
    }
}

// ============================================================================
// Skip
// ============================================================================

/// Permanently drop the failed unit and commit its offsets.
#[derive(Debug, Clone, Default)]
pub struct Skip {
    filter: PolicyFilter,
}

impl Skip {
    pub fn new() -> Self {
        Self::default()
    }
}

filter_builders!(Skip);

#[async_trait]
impl ErrorPolicy for Skip {
    fn name(&self) -> &str {
        "skip"
    }

    fn can_handle(&self, error: &BusError, context: &RetryContext) -> bool {
        self.filter.matches(error, context)
    }

    async fn apply(&self, failure: &Failure<'_>) -> Result<PolicyVerdict> {
        warn!(
            endpoint = %failure.endpoint,
            identity = %failure.context.identity(),
            attempts = failure.context.failed_attempts(),
            messages = failure.envelopes.len(),
            error = %failure.error,
            "Skipping message after failure"
        );
        Ok(PolicyVerdict::Skip)
    }
}

// ============================================================================
// Move
// ============================================================================

type HeaderTransform = Arc<dyn Fn(&mut MessageHeaders, &Failure<'_>) + Send + Sync>;

/// Republish the failed unit to another endpoint (dead letter pattern).
#[derive(Clone)]
pub struct Move {
    producer: Arc<dyn Producer>,
    transform: Option<HeaderTransform>,
    filter: PolicyFilter,
}

impl Move {
    pub fn to(producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            transform: None,
            filter: PolicyFilter::default(),
        }
    }

    /// Adjust the headers of each moved envelope.
    pub fn with_transform(
        mut self,
        transform: impl Fn(&mut MessageHeaders, &Failure<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn target(&self) -> &str {
        self.producer.endpoint()
    }

    fn failure_headers(failure: &Failure<'_>, envelope: &Envelope) -> MessageHeaders {
        let mut headers = MessageHeaders::new()
            .with(FAILED_ATTEMPTS_HEADER, failure.context.failed_attempts().to_string())
            .with(FAILURE_REASON_HEADER, failure.error.to_string())
            .with(FAILURE_KIND_HEADER, failure.error.kind().as_str())
            .with(SOURCE_ENDPOINT_HEADER, failure.endpoint)
            .with(FIRST_FAILED_AT_HEADER, failure.context.first_failure_at().to_rfc3339());
        if let Some(offset) = envelope.offset() {
            headers.insert(SOURCE_OFFSET_HEADER, offset.to_string());
        }
        if failure.context.identity() != envelope.identity() {
            headers.insert(BATCH_ID_HEADER, failure.context.identity());
        }
        headers
    }
}

impl fmt::Debug for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Move")
            .field("target", &self.target())
            .field("filter", &self.filter)
            .finish()
    }
}

filter_builders!(Move);

#[async_trait]
impl ErrorPolicy for Move {
    fn name(&self) -> &str {
        "move"
    }

    fn can_handle(&self, error: &BusError, context: &RetryContext) -> bool {
        self.filter.matches(error, context)
    }

    async fn apply(&self, failure: &Failure<'_>) -> Result<PolicyVerdict> {
        let target = self.target().to_string();
        let mut produced = Vec::with_capacity(failure.envelopes.len());

        for envelope in failure.envelopes {
            let mut extra = Self::failure_headers(failure, envelope);
            if let Some(transform) = &self.transform {
                transform(&mut extra, failure);
            }
            let moved = envelope
                .forwarded(target.as_str(), extra)
                .with_failed_attempts(failure.context.failed_attempts());

            match self.producer.produce(moved).await {
                Ok(offset) => produced.push(offset),
                Err(e) => {
                    error!(
                        endpoint = %failure.endpoint,
                        target = %target,
                        error = %e,
                        "Failed to move message"
                    );
                    return Err(e);
                }
            }
        }

        warn!(
            endpoint = %failure.endpoint,
            target = %target,
            identity = %failure.context.identity(),
            messages = produced.len(),
            error = %failure.error,
            "Moved failed message"
        );
        Ok(PolicyVerdict::Moved {
            endpoint: target,
            offsets: produced,
        })
    }
}

// ============================================================================
// Fatal
// ============================================================================

/// No recovery: force the consumer to disconnect.
#[derive(Debug, Clone, Default)]
pub struct Fatal {
    filter: PolicyFilter,
}

impl Fatal {
    pub fn new() -> Self {
        Self::default()
    }
}

filter_builders!(Fatal);

#[async_trait]
impl ErrorPolicy for Fatal {
    fn name(&self) -> &str {
        "fatal"
    }

    fn can_handle(&self, error: &BusError, context: &RetryContext) -> bool {
        self.filter.matches(error, context)
    }

    async fn apply(&self, failure: &Failure<'_>) -> Result<PolicyVerdict> {
        error!(
            endpoint = %failure.endpoint,
            identity = %failure.context.identity(),
            error = %failure.error,
            "Fatal error policy applied"
        );
        Ok(PolicyVerdict::Fatal)
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Delay before retrying an error no policy claimed.
///
/// Only retryable errors qualify, and only until the connection backoff is
/// exhausted.
fn default_retry_delay(error: &BusError, context: &RetryContext) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    let skip = context.failed_attempts().saturating_sub(1) as usize;
    connection_backoff().build().nth(skip)
}

/// Ordered chain of error policies. First match wins.
#[derive(Clone, Default)]
pub struct ErrorPolicyChain {
    policies: Vec<Arc<dyn ErrorPolicy>>,
}

impl ErrorPolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, policy: impl ErrorPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn push(&mut self, policy: Arc<dyn ErrorPolicy>) {
        self.policies.push(policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Evaluate the chain. Errors from the applied policy itself (a failed
    /// move) propagate to the caller, which must treat them as fatal.
    pub async fn evaluate(&self, failure: &Failure<'_>) -> Result<PolicyVerdict> {
        let Some(policy) = self
            .policies
            .iter()
            .find(|p| p.can_handle(failure.error, failure.context))
        else {
            if let Some(delay) = default_retry_delay(failure.error, failure.context) {
                debug!(
                    endpoint = %failure.endpoint,
                    identity = %failure.context.identity(),
                    attempts = failure.context.failed_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "No error policy matched, retrying transient failure"
                );
                return Ok(PolicyVerdict::Retry(delay));
            }
            warn!(
                endpoint = %failure.endpoint,
                identity = %failure.context.identity(),
                attempts = failure.context.failed_attempts(),
                error = %failure.error,
                "No error policy matched, escalating"
            );
            return Ok(PolicyVerdict::Fatal);
        };

        debug!(
            endpoint = %failure.endpoint,
            policy = policy.name(),
            attempts = failure.context.failed_attempts(),
            "Applying error policy"
        );
        let verdict = policy.apply(failure).await?;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, ERROR_POLICY_TOTAL};
            ERROR_POLICY_TOTAL.add(
                1,
                &[
                    metrics::endpoint_attr(failure.endpoint),
                    metrics::verdict_attr(verdict.as_str()),
                    metrics::error_kind_attr(failure.error.kind().as_str()),
                ],
            );
        }

        Ok(verdict)
    }
}

impl fmt::Debug for ErrorPolicyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.policy_names()).finish()
    }
}
