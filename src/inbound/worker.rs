//! The consumer loop.
//!
//! One worker owns one transport consumer. It interleaves three event
//! sources: shutdown requests, accumulator timers and transport deliveries.
//! Units are dispatched one at a time in arrival order, so handlers never run
//! concurrently for the same endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::commit::CommitTracker;
use super::handler::{Delivered, HandlerContext, HandlerRegistry, MessageBody, SequenceInfo};
use super::transaction::TransactionFactory;
use super::ConsumerState;
use crate::bus::{AckMode, BusError, Consumer, Result};
use crate::endpoint::{ConsumerEndpoint, NullMessageHandling, UnhandledMessageMode};
use crate::envelope::{Envelope, Offset};
use crate::error_policy::{Failure, PolicyVerdict, RetryContextStore};
use crate::sequence::{Accumulated, Expired, Sequence, SequenceAccumulator};
use crate::serialization::BusMessage;

/// Whether the loop keeps going after an event.
enum Flow {
    Continue,
    /// Stop, with the error that caused it (none on a requested shutdown).
    Stop(Option<BusError>),
}

/// Outcome of a transport failure run through the error policy chain.
enum Recovery {
    /// Repeat the operation.
    Retry,
    /// Give up on the operation and keep consuming.
    Proceed,
    Stop(Option<BusError>),
}

pub(crate) struct ConsumerWorker<M> {
    pub(crate) endpoint: Arc<ConsumerEndpoint<M>>,
    pub(crate) name: Arc<str>,
    pub(crate) registry: Arc<HandlerRegistry<M>>,
    pub(crate) transport: Arc<dyn Consumer>,
    pub(crate) transactions: Option<Arc<dyn TransactionFactory>>,
    pub(crate) state: watch::Sender<ConsumerState>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) accumulator: SequenceAccumulator,
    pub(crate) tracker: CommitTracker,
    pub(crate) retries: RetryContextStore,
    pub(crate) receive_failing: bool,
}

impl<M: BusMessage> ConsumerWorker<M> {
    /// Consume until shutdown is requested, the transport closes or a fatal
    /// error occurs. Open sequences are rolled back on the way out.
    pub(crate) async fn run(mut self) -> Result<()> {
        self.state.send_replace(ConsumerState::Listening);
        info!(
            endpoint = %self.name,
            ack_mode = ?self.tracker.mode(),
            policies = ?self.endpoint.error_policy(),
            "Consumer listening"
        );

        let outcome = loop {
            match self.next_event().await {
                Flow::Continue => {}
                Flow::Stop(outcome) => break outcome,
            }
        };

        self.shutdown().await;
        match outcome {
            Some(e) => {
                error!(endpoint = %self.name, error = %e, "Consumer stopped on fatal error");
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn next_event(&mut self) -> Flow {
        let deadline = self.accumulator.next_deadline();
        let transport = Arc::clone(&self.transport);

        tokio::select! {
            biased;
            changed = self.cancel.changed() => {
                let stop = changed.is_err() || *self.cancel.borrow();
                if stop {
                    info!(endpoint = %self.name, "Shutdown requested");
                    Flow::Stop(None)
                } else {
                    Flow::Continue
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                self.on_timer().await
            }
            received = transport.receive() => self.on_received(received).await,
        }
    }

    async fn on_received(&mut self, received: Result<Option<Envelope>>) -> Flow {
        let envelope = match received {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                info!(endpoint = %self.name, "Transport closed");
                return Flow::Stop(None);
            }
            Err(e) => {
                self.receive_failing = true;
                return match self.recover_transport("receive", e).await {
                    Recovery::Retry | Recovery::Proceed => Flow::Continue,
                    Recovery::Stop(e) => Flow::Stop(e),
                };
            }
        };

        if self.receive_failing {
            self.receive_failing = false;
            self.retries.clear(&transport_identity("receive", &self.name)).await;
        }

        self.tracker.track(&envelope.offsets());
        match self.accumulator.add(envelope, Instant::now()) {
            Accumulated::Pending => Flow::Continue,
            Accumulated::Ready(sequence) => self.process(sequence).await,
            Accumulated::Rejected { sequence, error } => self.on_rejected(sequence, error).await,
        }
    }

    async fn on_timer(&mut self) -> Flow {
        let mut expired = self.accumulator.expire(Instant::now()).into_iter();
        while let Some(next) = expired.next() {
            let flow = match next {
                Expired::Ready(sequence) => self.process(sequence).await,
                Expired::TimedOut(sequence) => {
                    #[cfg(feature = "otel")]
                    record_aborted(&self.name, "timeout");
                    self.rollback(sequence.offsets()).await;
                    Flow::Continue
                }
            };
            if let Flow::Stop(e) = flow {
                let remaining: Vec<Offset> = expired
                    .flat_map(|x| match x {
                        Expired::Ready(s) | Expired::TimedOut(s) => s.offsets(),
                    })
                    .collect();
                self.rollback(remaining).await;
                return Flow::Stop(e);
            }
        }
        Flow::Continue
    }

    async fn process(&mut self, sequence: Sequence) -> Flow {
        self.state.send_replace(ConsumerState::Dispatching);
        let flow = self.dispatch(sequence).await;
        if matches!(flow, Flow::Continue) {
            self.state.send_replace(ConsumerState::Listening);
        }
        flow
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    #[tracing::instrument(
        name = "inbound.dispatch",
        skip_all,
        fields(endpoint = %self.name, sequence = %sequence.key(), kind = sequence.kind().as_str(), size = sequence.len())
    )]
    async fn dispatch(&mut self, mut sequence: Sequence) -> Flow {
        #[cfg(feature = "otel")]
        let started = std::time::Instant::now();

        let fresh = match self.fresh_members(&sequence).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.rollback(sequence.offsets()).await;
                return Flow::Stop(Some(e));
            }
        };

        if fresh.is_empty() {
            debug!(endpoint = %self.name, "Every message already processed, committing");
            sequence.mark_processed();
            return self.commit(sequence.offsets()).await;
        }

        let identity = sequence.identity();
        let mut attempt = 1;
        let flow = loop {
            let error = match self.attempt(&sequence, &fresh, attempt).await {
                Ok(()) => {
                    sequence.mark_processed();
                    break self.complete(&identity, &sequence, &fresh).await;
                }
                Err(error) => error,
            };

            if error.is_fatal() {
                self.rollback(sequence.offsets()).await;
                break Flow::Stop(Some(error));
            }

            warn!(
                endpoint = %self.name,
                identity = %identity,
                attempt,
                error = %error,
                "Dispatch failed"
            );
            match self.evaluate(&identity, &error, &fresh).await {
                Ok(PolicyVerdict::Retry(delay)) => {
                    if !self.pause(delay).await {
                        self.rollback(sequence.offsets()).await;
                        break Flow::Stop(None);
                    }
                    attempt += 1;
                }
                Ok(verdict @ (PolicyVerdict::Skip | PolicyVerdict::Moved { .. })) => {
                    info!(endpoint = %self.name, identity = %identity, verdict = verdict.as_str(), "Failure resolved by policy");
                    sequence.mark_processed();
                    break self.complete(&identity, &sequence, &fresh).await;
                }
                Ok(PolicyVerdict::Fatal) => {
                    self.rollback(sequence.offsets()).await;
                    break Flow::Stop(Some(error));
                }
                Err(policy_error) => {
                    error!(endpoint = %self.name, error = %policy_error, "Error policy failed");
                    self.rollback(sequence.offsets()).await;
                    break Flow::Stop(Some(policy_error));
                }
            }
        };

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, INBOUND_DISPATCH_DURATION, INBOUND_PROCESSED_TOTAL};
            let outcome = match &flow {
                Flow::Continue => "committed",
                Flow::Stop(_) => "rolled_back",
            };
            let attrs = [metrics::endpoint_attr(&self.name), metrics::outcome_attr(outcome)];
            INBOUND_DISPATCH_DURATION.record(started.elapsed().as_secs_f64(), &attrs);
            INBOUND_PROCESSED_TOTAL.add(1, &attrs);
        }

        flow
    }

    /// Members not yet processed according to the exactly-once strategy.
    async fn fresh_members(&self, sequence: &Sequence) -> Result<Vec<Envelope>> {
        let Some(strategy) = self.endpoint.exactly_once() else {
            return Ok(sequence.members().to_vec());
        };

        let mut fresh = Vec::with_capacity(sequence.len());
        for envelope in sequence.members() {
            if strategy.has_been_processed(envelope).await? {
                debug!(
                    endpoint = %self.name,
                    identity = %envelope.identity(),
                    strategy = strategy.name(),
                    "Skipping already processed message"
                );
                #[cfg(feature = "otel")]
                {
                    use crate::utils::metrics::{self, INBOUND_DUPLICATE_TOTAL};
                    INBOUND_DUPLICATE_TOTAL.add(1, &[metrics::endpoint_attr(&self.name)]);
                }
                continue;
            }
            fresh.push(envelope.clone());
        }
        Ok(fresh)
    }

    /// One delivery attempt: decode, route, run handlers inside a transaction.
    async fn attempt(&self, sequence: &Sequence, fresh: &[Envelope], attempt: u32) -> Result<()> {
        let delivered = self.decode_all(fresh)?;
        let (plan, unhandled) = self.registry.plan(&delivered);

        if let Some(first) = unhandled.first() {
            let message_type = first.message_type().unwrap_or("<null>");
            match self.endpoint.unhandled() {
                UnhandledMessageMode::Throw => return Err(BusError::Unhandled(message_type.to_string())),
                UnhandledMessageMode::Ignore => debug!(
                    endpoint = %self.name,
                    message_type = %message_type,
                    count = unhandled.len(),
                    "Ignoring unhandled messages"
                ),
            }
        }
        if plan.is_empty() {
            return Ok(());
        }

        let transaction = match &self.transactions {
            Some(factory) => Some(factory.begin(&self.name).await?),
            None => None,
        };
        let context = HandlerContext::new(
            Arc::clone(&self.name),
            SequenceInfo {
                kind: sequence.kind(),
                key: sequence.key().to_string(),
                size: sequence.len(),
            },
            attempt,
            transaction.clone(),
        );

        for (handler, messages) in &plan {
            if let Err(e) = handler.handle(messages, &context).await {
                let error = BusError::handler(handler.name(), e);
                if let Some(tx) = &transaction {
                    if let Err(rollback_error) = tx.rollback().await {
                        warn!(transaction = tx.id(), error = %rollback_error, "Transaction rollback failed");
                    }
                }
                return Err(error);
            }
        }

        if let Some(tx) = &transaction {
            tx.commit().await?;
        }
        Ok(())
    }

    fn decode_all(&self, envelopes: &[Envelope]) -> Result<Vec<Delivered<M>>> {
        let mut delivered = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let body = match self.endpoint.decode(envelope)? {
                Some(message) => MessageBody::Message(message),
                None => match self.endpoint.null_handling() {
                    NullMessageHandling::Tombstone => MessageBody::Tombstone {
                        key: envelope.message_key().map(str::to_string),
                    },
                    NullMessageHandling::ForwardAsNull => MessageBody::Null,
                    NullMessageHandling::Skip => {
                        debug!(endpoint = %self.name, identity = %envelope.identity(), "Skipping null message");
                        continue;
                    }
                },
            };
            delivered.push(Delivered::new(envelope.clone(), body));
        }
        Ok(delivered)
    }

    async fn evaluate(&self, identity: &str, error: &BusError, envelopes: &[Envelope]) -> Result<PolicyVerdict> {
        let context = self.retries.record_failure(identity, error).await;
        let verdict = self
            .endpoint
            .error_policy()
            .evaluate(&Failure {
                error,
                context: &context,
                envelopes,
                endpoint: &self.name,
            })
            .await?;
        if let PolicyVerdict::Retry(delay) = &verdict {
            self.retries.add_backoff(identity, *delay).await;
        }
        Ok(verdict)
    }

    /// Record the unit as processed and acknowledge it.
    async fn complete(&mut self, identity: &str, sequence: &Sequence, fresh: &[Envelope]) -> Flow {
        if let Some(strategy) = self.endpoint.exactly_once() {
            if let Err(e) = strategy.mark_processed(fresh).await {
                self.rollback(sequence.offsets()).await;
                return Flow::Stop(Some(e));
            }
        }
        self.retries.clear(identity).await;
        self.commit(sequence.offsets()).await
    }

    // ========================================================================
    // Aborted sequences
    // ========================================================================

    async fn on_rejected(&mut self, mut sequence: Sequence, error: BusError) -> Flow {
        #[cfg(feature = "otel")]
        record_aborted(&self.name, "protocol");

        let identity = sequence.key().to_string();
        let members = sequence.members().to_vec();
        match self.evaluate(&identity, &error, &members).await {
            Ok(PolicyVerdict::Retry(delay)) => {
                let resumed = self.pause(delay).await;
                self.rollback(sequence.offsets()).await;
                if resumed {
                    Flow::Continue
                } else {
                    Flow::Stop(None)
                }
            }
            Ok(PolicyVerdict::Skip | PolicyVerdict::Moved { .. }) => {
                sequence.mark_processed();
                self.complete(&identity, &sequence, &members).await
            }
            Ok(PolicyVerdict::Fatal) => {
                self.rollback(sequence.offsets()).await;
                Flow::Stop(Some(error))
            }
            Err(policy_error) => {
                self.rollback(sequence.offsets()).await;
                Flow::Stop(Some(policy_error))
            }
        }
    }

    // ========================================================================
    // Transport interaction
    // ========================================================================

    async fn commit(&mut self, offsets: Vec<Offset>) -> Flow {
        let ready = self.tracker.resolve(&offsets);
        if ready.is_empty() {
            return Flow::Continue;
        }

        let mut retried = false;
        loop {
            match self.transport.acknowledge(&ready).await {
                Ok(()) => {
                    if retried {
                        self.retries.clear(&transport_identity("ack", &self.name)).await;
                    }
                    debug!(endpoint = %self.name, count = ready.len(), "Acknowledged");
                    return Flow::Continue;
                }
                Err(e) => match self.recover_transport("ack", e).await {
                    Recovery::Retry => retried = true,
                    Recovery::Proceed => return Flow::Continue,
                    Recovery::Stop(e) => return Flow::Stop(e),
                },
            }
        }
    }

    async fn recover_transport(&mut self, operation: &str, error: BusError) -> Recovery {
        warn!(endpoint = %self.name, operation, error = %error, "Transport operation failed");
        if error.is_fatal() {
            return Recovery::Stop(Some(error));
        }

        let identity = transport_identity(operation, &self.name);
        match self.evaluate(&identity, &error, &[]).await {
            Ok(PolicyVerdict::Retry(delay)) => {
                if self.pause(delay).await {
                    Recovery::Retry
                } else {
                    Recovery::Stop(None)
                }
            }
            Ok(PolicyVerdict::Skip | PolicyVerdict::Moved { .. }) => {
                self.retries.clear(&identity).await;
                Recovery::Proceed
            }
            Ok(PolicyVerdict::Fatal) => Recovery::Stop(Some(error)),
            Err(policy_error) => Recovery::Stop(Some(policy_error)),
        }
    }

    /// Release offsets for redelivery.
    ///
    /// Cumulative transports can only seek a whole stream back, so every
    /// buffered member past the rewind point is dropped too.
    async fn rollback(&mut self, offsets: Vec<Offset>) {
        if offsets.is_empty() {
            return;
        }
        let release = match self.tracker.mode() {
            AckMode::Individual => offsets,
            AckMode::Cumulative => self.rewind(offsets),
        };
        debug!(endpoint = %self.name, count = release.len(), "Rolling back");
        if let Err(e) = self.transport.rollback(&release).await {
            warn!(endpoint = %self.name, error = %e, "Rollback failed");
        }
    }

    fn rewind(&mut self, offsets: Vec<Offset>) -> Vec<Offset> {
        let mut floors: HashMap<String, u64> = HashMap::new();
        let mut release = Vec::new();
        for offset in offsets {
            match offset.as_position() {
                Some(position) => {
                    lower(&mut floors, offset.stream(), position);
                }
                None => release.push(offset),
            }
        }

        loop {
            let mut lowered = false;
            let current: Vec<(String, u64)> = floors.iter().map(|(s, p)| (s.clone(), *p)).collect();
            for (stream, floor) in current {
                for dropped in self.accumulator.discard_from(&stream, floor) {
                    if let Some(position) = dropped.as_position() {
                        lowered |= lower(&mut floors, dropped.stream(), position);
                    }
                }
            }
            if !lowered {
                break;
            }
        }

        for (stream, floor) in floors {
            self.tracker.rewind(&stream, floor);
            release.push(Offset::position(stream, floor));
        }
        release
    }

    /// Sleep, returning `false` if shutdown was requested meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                changed = self.cancel.changed() => {
                    let stop = changed.is_err() || *self.cancel.borrow();
                    if stop {
                        return false;
                    }
                }
                _ = sleep_until(wake) => return true,
            }
        }
    }

    async fn shutdown(&mut self) {
        let aborted = self.accumulator.abort_all();
        let offsets: Vec<Offset> = aborted.iter().flat_map(Sequence::offsets).collect();
        if !offsets.is_empty() {
            info!(endpoint = %self.name, sequences = aborted.len(), "Rolling back open sequences");
        }
        self.rollback(offsets).await;

        if let Err(e) = self.transport.close().await {
            warn!(endpoint = %self.name, error = %e, "Failed to close transport consumer");
        }
        self.state.send_replace(ConsumerState::Disconnected);
        info!(endpoint = %self.name, "Consumer disconnected");
    }
}

/// Lower the floor of `stream` to `position`. Returns whether it moved.
fn lower(floors: &mut HashMap<String, u64>, stream: &str, position: u64) -> bool {
    match floors.get_mut(stream) {
        Some(floor) if *floor <= position => false,
        Some(floor) => {
            *floor = position;
            true
        }
        None => {
            floors.insert(stream.to_string(), position);
            true
        }
    }
}

fn transport_identity(operation: &str, endpoint: &str) -> String {
    format!("{}:{}", operation, endpoint)
}

#[cfg(feature = "otel")]
fn record_aborted(endpoint: &str, reason: &str) {
    use crate::utils::metrics::{self, SEQUENCE_ABORTED_TOTAL};
    SEQUENCE_ABORTED_TOTAL.add(1, &[metrics::endpoint_attr(endpoint), metrics::outcome_attr(reason)]);
}
