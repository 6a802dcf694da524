//! Sequence and batch accumulation.
//!
//! Groups related envelopes into one logical processing unit:
//!
//! - **Batch**: size/time triggered. Completes when `size` members are
//!   buffered or `max_wait` has elapsed since the first member, whichever
//!   comes first. The timer arms on the first addition.
//! - **Chunk**: correlated by `x-chunk-id`. Completes on the expected count
//!   or the last marker; aborts when no member arrives within the sequence
//!   timeout. A completed chunk sequence becomes one reassembled envelope,
//!   which may then join a batch.
//!
//! The accumulator is owned by a single consumer loop and mutated through
//! `&mut self`, so arrivals and timeouts for the same key never interleave.

mod chunk;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::BusError;
use crate::endpoint::BatchSettings;
use crate::envelope::{new_message_id, Envelope, Offset};

pub use chunk::{split_into_chunks, ChunkInfo};

/// Lifecycle of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Open,
    Complete,
    Processed,
    Aborted,
}

/// What grouped the members of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// One envelope, no grouping configured.
    Single,
    /// Size/time batch.
    Batch,
    /// Chunked message.
    Chunk,
}

impl SequenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
            Self::Chunk => "chunk",
        }
    }
}

/// Ordered group of envelopes processed and committed as one unit.
pub struct Sequence {
    key: String,
    kind: SequenceKind,
    state: SequenceState,
    members: Vec<Envelope>,
    deadline: Option<Instant>,
    expected: Option<usize>,
}

impl Sequence {
    fn open(key: String, kind: SequenceKind, deadline: Instant) -> Self {
        Self {
            key,
            kind,
            state: SequenceState::Open,
            members: Vec::new(),
            deadline: Some(deadline),
            expected: None,
        }
    }

    /// A complete one-element unit.
    pub fn single(envelope: Envelope) -> Self {
        Self {
            key: envelope.identity(),
            kind: SequenceKind::Single,
            state: SequenceState::Complete,
            members: vec![envelope],
            deadline: None,
            expected: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn members(&self) -> &[Envelope] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// When the sequence times out (or, for a batch, dispatches).
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Every broker offset the members account for, in arrival order.
    pub fn offsets(&self) -> Vec<Offset> {
        self.members.iter().flat_map(Envelope::offsets).collect()
    }

    /// Identity used for retry bookkeeping: the message identity for a single
    /// envelope, the correlation key otherwise.
    pub fn identity(&self) -> String {
        match (self.kind, self.members.as_slice()) {
            (SequenceKind::Single, [only]) => only.identity(),
            _ => self.key.clone(),
        }
    }

    pub fn into_members(self) -> Vec<Envelope> {
        self.members
    }

    pub fn mark_processed(&mut self) {
        self.state = SequenceState::Processed;
    }

    pub fn abort(&mut self) {
        self.state = SequenceState::Aborted;
        self.deadline = None;
    }

    fn complete(mut self) -> Self {
        self.state = SequenceState::Complete;
        self.deadline = None;
        self
    }

    fn touches(&self, stream: &str, from: u64) -> bool {
        self.members.iter().any(|m| covers(m, stream, from))
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("members", &self.members.len())
            .finish()
    }
}

fn covers(envelope: &Envelope, stream: &str, from: u64) -> bool {
    envelope
        .offsets()
        .iter()
        .any(|o| o.stream() == stream && o.as_position().is_some_and(|p| p >= from))
}

/// Result of adding one envelope.
#[derive(Debug)]
pub enum Accumulated {
    /// Buffered, nothing to dispatch yet.
    Pending,
    /// A complete unit ready for dispatch.
    Ready(Sequence),
    /// The envelope broke the chunk protocol; the aborted sequence (including
    /// the offending envelope) must be rolled back or resolved by the error
    /// policy chain.
    Rejected { sequence: Sequence, error: BusError },
}

/// Result of a timer check.
#[derive(Debug)]
pub enum Expired {
    /// A batch whose max wait elapsed, ready for dispatch.
    Ready(Sequence),
    /// A chunk sequence that timed out and was aborted.
    TimedOut(Sequence),
}

/// Per-consumer sequence accumulator.
pub struct SequenceAccumulator {
    endpoint: Arc<str>,
    batch_settings: Option<BatchSettings>,
    sequence_timeout: Duration,
    batch: Option<Sequence>,
    chunks: HashMap<String, Sequence>,
}

impl SequenceAccumulator {
    pub fn new(endpoint: Arc<str>, batch_settings: Option<BatchSettings>, sequence_timeout: Duration) -> Self {
        Self {
            endpoint,
            batch_settings,
            sequence_timeout,
            batch: None,
            chunks: HashMap::new(),
        }
    }

    /// Number of open sequences (the open batch included).
    pub fn open_count(&self) -> usize {
        self.chunks.len() + usize::from(self.batch.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.open_count() == 0
    }

    /// Earliest pending deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batch
            .iter()
            .chain(self.chunks.values())
            .filter_map(Sequence::deadline)
            .min()
    }

    /// Add an arriving envelope.
    pub fn add(&mut self, envelope: Envelope, now: Instant) -> Accumulated {
        match ChunkInfo::from_headers(envelope.headers()) {
            Ok(Some(info)) => self.add_chunk(envelope, info, now),
            Ok(None) => self.add_to_batch(envelope, now),
            Err(error) => {
                let mut sequence = Sequence::single(envelope);
                sequence.abort();
                Accumulated::Rejected { sequence, error }
            }
        }
    }

    fn add_to_batch(&mut self, envelope: Envelope, now: Instant) -> Accumulated {
        let Some(settings) = self.batch_settings else {
            return Accumulated::Ready(Sequence::single(envelope));
        };

        let batch = self.batch.get_or_insert_with(|| {
            let key = new_message_id();
            debug!(endpoint = %self.endpoint, batch = %key, "Batch opened");
            Sequence::open(key, SequenceKind::Batch, now + settings.max_wait)
        });
        batch.members.push(envelope);

        if batch.len() >= settings.size {
            match self.batch.take() {
                Some(full) => {
                    debug!(endpoint = %self.endpoint, batch = %full.key, size = full.len(), "Batch full");
                    Accumulated::Ready(full.complete())
                }
                None => Accumulated::Pending,
            }
        } else {
            Accumulated::Pending
        }
    }

    fn add_chunk(&mut self, envelope: Envelope, info: ChunkInfo, now: Instant) -> Accumulated {
        let deadline = now + self.sequence_timeout;

        let mut sequence = match self.chunks.remove(&info.id) {
            Some(open) => open,
            None => {
                if info.index != 0 {
                    let mut orphan = Sequence::open(info.id.clone(), SequenceKind::Chunk, deadline);
                    orphan.members.push(envelope);
                    orphan.abort();
                    return Accumulated::Rejected {
                        error: protocol_error(&info.id, format!("sequence starts at chunk {}", info.index)),
                        sequence: orphan,
                    };
                }
                Sequence::open(info.id.clone(), SequenceKind::Chunk, deadline)
            }
        };

        if let Err(message) = check_chunk(&sequence, &info) {
            sequence.members.push(envelope);
            sequence.abort();
            warn!(
                endpoint = %self.endpoint,
                sequence = %info.id,
                reason = %message,
                "Chunk sequence rejected"
            );
            return Accumulated::Rejected {
                error: protocol_error(&info.id, message),
                sequence,
            };
        }

        sequence.members.push(envelope);
        sequence.deadline = Some(deadline);
        if sequence.expected.is_none() {
            sequence.expected = info.count;
        }

        let reached_count = sequence.expected == Some(sequence.len());
        if !(reached_count || info.last) {
            self.chunks.insert(info.id, sequence);
            return Accumulated::Pending;
        }

        if info.last && sequence.expected.is_some_and(|n| n != sequence.len()) {
            sequence.abort();
            return Accumulated::Rejected {
                error: protocol_error(&info.id, "last chunk arrived before the expected count".to_string()),
                sequence,
            };
        }

        debug!(
            endpoint = %self.endpoint,
            sequence = %info.id,
            chunks = sequence.len(),
            "Chunk sequence complete"
        );
        let whole = chunk::reassemble(Arc::clone(&self.endpoint), &sequence.members);

        if self.batch_settings.is_some() {
            return self.add_to_batch(whole, now);
        }
        Accumulated::Ready(Sequence {
            key: sequence.key,
            kind: SequenceKind::Chunk,
            state: SequenceState::Complete,
            members: vec![whole],
            deadline: None,
            expected: sequence.expected,
        })
    }

    /// Collect everything whose deadline passed at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();

        if self.batch.as_ref().and_then(Sequence::deadline).is_some_and(|d| d <= now) {
            if let Some(batch) = self.batch.take() {
                debug!(endpoint = %self.endpoint, batch = %batch.key, size = batch.len(), "Batch max wait elapsed");
                expired.push(Expired::Ready(batch.complete()));
            }
        }

        let timed_out: Vec<String> = self
            .chunks
            .iter()
            .filter(|(_, s)| s.deadline().is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in timed_out {
            if let Some(mut sequence) = self.chunks.remove(&key) {
                warn!(
                    endpoint = %self.endpoint,
                    sequence = %key,
                    chunks = sequence.len(),
                    "Chunk sequence timed out"
                );
                sequence.abort();
                expired.push(Expired::TimedOut(sequence));
            }
        }

        expired
    }

    /// Drop every buffered member at or after `from` in `stream`.
    ///
    /// Used when a cumulative transport rewinds a partition: those members
    /// will be redelivered. A chunk sequence touching the range is dropped
    /// whole. Returns the offsets of everything dropped.
    pub fn discard_from(&mut self, stream: &str, from: u64) -> Vec<Offset> {
        let mut dropped = Vec::new();

        if let Some(batch) = self.batch.as_mut() {
            batch.members.retain(|m| {
                if covers(m, stream, from) {
                    dropped.extend(m.offsets());
                    false
                } else {
                    true
                }
            });
            if batch.is_empty() {
                self.batch = None;
            }
        }

        let touched: Vec<String> = self
            .chunks
            .iter()
            .filter(|(_, s)| s.touches(stream, from))
            .map(|(k, _)| k.clone())
            .collect();
        for key in touched {
            if let Some(sequence) = self.chunks.remove(&key) {
                dropped.extend(sequence.offsets());
            }
        }

        dropped
    }

    /// Abort every open sequence (shutdown). Nothing returned here may be committed.
    pub fn abort_all(&mut self) -> Vec<Sequence> {
        let mut aborted: Vec<Sequence> = self.batch.take().into_iter().collect();
        aborted.extend(self.chunks.drain().map(|(_, s)| s));
        for sequence in &mut aborted {
            sequence.abort();
        }
        aborted
    }
}

fn check_chunk(sequence: &Sequence, info: &ChunkInfo) -> std::result::Result<(), String> {
    let next = sequence.len();
    if info.index < next {
        return Err(format!("duplicate chunk index {}", info.index));
    }
    if info.index > next {
        return Err(format!("chunk {} arrived before chunk {}", info.index, next));
    }
    if let (Some(expected), Some(count)) = (sequence.expected, info.count) {
        if expected != count {
            return Err(format!("chunk count changed from {} to {}", expected, count));
        }
    }
    if let Some(count) = sequence.expected.or(info.count) {
        if info.index >= count {
            return Err(format!("chunk index {} out of range for {} chunks", info.index, count));
        }
    }
    Ok(())
}

fn protocol_error(sequence: &str, message: String) -> BusError {
    BusError::SequenceProtocol {
        sequence: sequence.to_string(),
        message,
    }
}
