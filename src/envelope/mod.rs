//! Envelope and offset model.
//!
//! An [`Envelope`] wraps a raw payload, its headers and the broker-assigned
//! [`Offset`] it arrived at (or will be produced to). Everything else in the
//! pipeline moves envelopes around; nothing mutates them after creation except
//! for processing metadata such as the failed-attempt counter.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use uuid::Uuid;

// ============================================================================
// Well-known headers
// ============================================================================

/// Unique message identifier, assigned on production when absent.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";
/// Type tag used to resolve subscribed handlers.
pub const MESSAGE_TYPE_HEADER: &str = "x-message-type";
/// Partitioning key (also the tombstone key).
pub const MESSAGE_KEY_HEADER: &str = "x-message-key";
/// Payload content type set by the serializer.
pub const CONTENT_TYPE_HEADER: &str = "content-type";
/// Number of failed processing attempts, attached by the move policy.
pub const FAILED_ATTEMPTS_HEADER: &str = "x-failed-attempts";
/// Display text of the last failure.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";
/// Error kind of the last failure.
pub const FAILURE_KIND_HEADER: &str = "x-failure-kind";
/// Endpoint a moved message originally arrived on.
pub const SOURCE_ENDPOINT_HEADER: &str = "x-source-endpoint";
/// Offset a moved message originally arrived at.
pub const SOURCE_OFFSET_HEADER: &str = "x-source-offset";
/// Correlation key shared by all chunks of one message.
pub const CHUNK_ID_HEADER: &str = "x-chunk-id";
/// Zero-based chunk index.
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
/// Total number of chunks, when known up front.
pub const CHUNK_COUNT_HEADER: &str = "x-chunk-count";
/// Marks the final chunk.
pub const CHUNK_LAST_HEADER: &str = "x-chunk-last";
/// Identifier of the batch a moved message failed in.
pub const BATCH_ID_HEADER: &str = "x-batch-id";
/// RFC 3339 time of the first failure of a moved message.
pub const FIRST_FAILED_AT_HEADER: &str = "x-first-failed-at";

/// Headers that only make sense on a single chunk and are stripped on reassembly.
pub(crate) const CHUNK_HEADERS: [&str; 4] = [
    CHUNK_ID_HEADER,
    CHUNK_INDEX_HEADER,
    CHUNK_COUNT_HEADER,
    CHUNK_LAST_HEADER,
];

// ============================================================================
// Headers
// ============================================================================

/// String to string message headers.
///
/// Backed by a `BTreeMap` so iteration order (and therefore anything persisted
/// or logged from it) is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(BTreeMap<String, String>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Parse a header value, returning `None` when absent or malformed.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ============================================================================
// Offset
// ============================================================================

/// Broker-specific value of an offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OffsetValue {
    /// Monotonic position within its stream (log-based transports).
    Position(u64),
    /// Opaque delivery token with no ordering (queue-based transports).
    Token(String),
}

/// Position of a message within its partition/stream.
///
/// Offsets are totally ordered within one stream when both values are
/// positions. Offsets from different streams, or token offsets, are not
/// comparable: `partial_cmp` returns `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Offset {
    stream: Arc<str>,
    value: OffsetValue,
}

impl Offset {
    pub fn position(stream: impl Into<Arc<str>>, position: u64) -> Self {
        Self {
            stream: stream.into(),
            value: OffsetValue::Position(position),
        }
    }

    pub fn token(stream: impl Into<Arc<str>>, token: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            value: OffsetValue::Token(token.into()),
        }
    }

    /// Partition/stream identifier.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn value(&self) -> &OffsetValue {
        &self.value
    }

    /// Numeric position, if this offset is ordered.
    pub fn as_position(&self) -> Option<u64> {
        match self.value {
            OffsetValue::Position(p) => Some(p),
            OffsetValue::Token(_) => None,
        }
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.stream != other.stream {
            return None;
        }
        match (&self.value, &other.value) {
            (OffsetValue::Position(a), OffsetValue::Position(b)) => Some(a.cmp(b)),
            (OffsetValue::Token(a), OffsetValue::Token(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// Stable string form: `stream@position` or `stream#token`.
impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            OffsetValue::Position(p) => write!(f, "{}@{}", self.stream, p),
            OffsetValue::Token(t) => write!(f, "{}#{}", self.stream, t),
        }
    }
}

/// Error parsing the persisted form of an offset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid offset '{0}'")]
pub struct ParseOffsetError(pub String);

impl FromStr for Offset {
    type Err = ParseOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Tokens may contain '@', so the token separator wins when it comes first.
        let at = s.rfind('@');
        let hash = s.find('#');
        match (hash, at) {
            (Some(h), _) if h > 0 => Ok(Offset::token(&s[..h], &s[h + 1..])),
            (_, Some(a)) if a > 0 => s[a + 1..]
                .parse::<u64>()
                .map(|p| Offset::position(&s[..a], p))
                .map_err(|_| ParseOffsetError(s.to_string())),
            _ => Err(ParseOffsetError(s.to_string())),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A message payload plus headers plus its broker position.
///
/// `payload` is `None` for null (tombstone) messages. Reassembled chunked
/// messages cover several broker offsets; [`Envelope::offsets`] returns all of
/// them so commits stay complete.
#[derive(Debug, Clone)]
pub struct Envelope {
    endpoint: Arc<str>,
    headers: MessageHeaders,
    payload: Option<Arc<[u8]>>,
    offset: Option<Offset>,
    covered: Vec<Offset>,
    failed_attempts: u32,
}

impl Envelope {
    /// Create an outbound envelope (no offset yet).
    pub fn outbound(
        endpoint: impl Into<Arc<str>>,
        headers: MessageHeaders,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers,
            payload: payload.map(Arc::from),
            offset: None,
            covered: Vec::new(),
            failed_attempts: 0,
        }
    }

    /// Create an inbound envelope as received from the transport.
    pub fn inbound(
        endpoint: impl Into<Arc<str>>,
        headers: MessageHeaders,
        payload: Option<Vec<u8>>,
        offset: Offset,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers,
            payload: payload.map(Arc::from),
            offset: Some(offset),
            covered: Vec::new(),
            failed_attempts: 0,
        }
    }

    pub(crate) fn reassembled(
        endpoint: Arc<str>,
        headers: MessageHeaders,
        payload: Vec<u8>,
        offsets: Vec<Offset>,
    ) -> Self {
        Self {
            endpoint,
            headers,
            payload: Some(Arc::from(payload)),
            offset: offsets.last().cloned(),
            covered: offsets,
            failed_attempts: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.payload.is_none()
    }

    /// The broker position of this envelope (the last chunk, when reassembled).
    pub fn offset(&self) -> Option<&Offset> {
        self.offset.as_ref()
    }

    /// Every broker offset this envelope accounts for.
    pub fn offsets(&self) -> Vec<Offset> {
        if !self.covered.is_empty() {
            return self.covered.clone();
        }
        self.offset.iter().cloned().collect()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MESSAGE_ID_HEADER)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MESSAGE_TYPE_HEADER)
    }

    pub fn message_key(&self) -> Option<&str> {
        self.headers.get(MESSAGE_KEY_HEADER)
    }

    /// Identity used for retry bookkeeping and deduplication.
    ///
    /// The message id when present, otherwise the stable offset string.
    pub fn identity(&self) -> String {
        if let Some(id) = self.message_id() {
            return id.to_string();
        }
        match &self.offset {
            Some(offset) => offset.to_string(),
            None => format!("{}:unpositioned", self.endpoint),
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Attach the failed-attempt counter. The only mutation allowed after creation.
    pub fn with_failed_attempts(mut self, attempts: u32) -> Self {
        self.failed_attempts = attempts;
        self
    }

    /// Copy of this envelope re-targeted at another endpoint with extra headers.
    ///
    /// The offset is dropped: the copy is an outbound message.
    pub fn forwarded(&self, endpoint: impl Into<Arc<str>>, extra: MessageHeaders) -> Self {
        let mut headers = self.headers.clone();
        for (k, v) in extra.iter() {
            headers.insert(k, v);
        }
        Self {
            endpoint: endpoint.into(),
            headers,
            payload: self.payload.clone(),
            offset: None,
            covered: Vec::new(),
            failed_attempts: 0,
        }
    }

    pub(crate) fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Generate a fresh message id.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
