//! Endpoint configuration.
//!
//! An endpoint names a logical topic/queue and carries the processing options
//! applied to it. Endpoints are assembled with plain constructors and `with_*`
//! methods and are immutable once handed to a consumer or router.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bus::{BusError, Result};
use crate::envelope::{new_message_id, Envelope, MessageHeaders, MESSAGE_ID_HEADER, MESSAGE_KEY_HEADER};
use crate::error_policy::ErrorPolicyChain;
use crate::exactly_once::ExactlyOnceStrategy;
use crate::sequence::split_into_chunks;
use crate::serialization::{
    validate_message, BusMessage, EncryptionSettings, JsonSerializer, MessageSerializer,
    MessageValidator, ValidationMode,
};

/// Sequences abort when no member arrives within this interval.
pub const DEFAULT_SEQUENCE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Size/time batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Dispatch once this many messages are buffered.
    pub size: usize,
    /// Dispatch once this much time has passed since the first buffered message.
    pub max_wait: Duration,
}

impl BatchSettings {
    pub fn new(size: usize, max_wait: Duration) -> Self {
        Self { size, max_wait }
    }
}

/// How inbound messages with a null payload are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NullMessageHandling {
    /// Deliver a tombstone carrying the message key.
    #[default]
    Tombstone,
    /// Commit without dispatching.
    Skip,
    /// Deliver an empty body.
    ForwardAsNull,
}

/// What to do with messages no handler subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledMessageMode {
    /// Fail with `BusError::Unhandled`, evaluated by the error policy chain.
    #[default]
    Throw,
    /// Commit silently.
    Ignore,
}

// ============================================================================
// Consumer endpoint
// ============================================================================

/// Inbound endpoint configuration.
pub struct ConsumerEndpoint<M> {
    name: Arc<str>,
    serializer: Arc<dyn MessageSerializer<M>>,
    encryption: Option<EncryptionSettings>,
    validator: Option<Arc<dyn MessageValidator<M>>>,
    validation: ValidationMode,
    batch: Option<BatchSettings>,
    sequence_timeout: Duration,
    error_policy: ErrorPolicyChain,
    exactly_once: Option<Arc<dyn ExactlyOnceStrategy>>,
    null_handling: NullMessageHandling,
    unhandled: UnhandledMessageMode,
}

impl<M> ConsumerEndpoint<M>
where
    M: BusMessage + Serialize + DeserializeOwned,
{
    /// Endpoint with the JSON serializer and default options.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_serializer(name, Arc::new(JsonSerializer::<M>::new()))
    }
}

impl<M: BusMessage> ConsumerEndpoint<M> {
    pub fn with_serializer(name: impl Into<Arc<str>>, serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        Self {
            name: name.into(),
            serializer,
            encryption: None,
            validator: None,
            validation: ValidationMode::default(),
            batch: None,
            sequence_timeout: DEFAULT_SEQUENCE_TIMEOUT,
            error_policy: ErrorPolicyChain::new(),
            exactly_once: None,
            null_handling: NullMessageHandling::default(),
            unhandled: UnhandledMessageMode::default(),
        }
    }

    pub fn with_batch(mut self, size: usize, max_wait: Duration) -> Self {
        self.batch = Some(BatchSettings::new(size, max_wait));
        self
    }

    pub fn with_sequence_timeout(mut self, timeout: Duration) -> Self {
        self.sequence_timeout = timeout;
        self
    }

    pub fn with_error_policy(mut self, chain: ErrorPolicyChain) -> Self {
        self.error_policy = chain;
        self
    }

    pub fn with_exactly_once(mut self, strategy: Arc<dyn ExactlyOnceStrategy>) -> Self {
        self.exactly_once = Some(strategy);
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionSettings) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_validation(mut self, validator: Arc<dyn MessageValidator<M>>, mode: ValidationMode) -> Self {
        self.validator = Some(validator);
        self.validation = mode;
        self
    }

    pub fn with_null_handling(mut self, mode: NullMessageHandling) -> Self {
        self.null_handling = mode;
        self
    }

    pub fn with_unhandled(mut self, mode: UnhandledMessageMode) -> Self {
        self.unhandled = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn batch(&self) -> Option<BatchSettings> {
        self.batch
    }

    pub fn sequence_timeout(&self) -> Duration {
        self.sequence_timeout
    }

    pub fn error_policy(&self) -> &ErrorPolicyChain {
        &self.error_policy
    }

    pub fn exactly_once(&self) -> Option<&Arc<dyn ExactlyOnceStrategy>> {
        self.exactly_once.as_ref()
    }

    pub fn null_handling(&self) -> NullMessageHandling {
        self.null_handling
    }

    pub fn unhandled(&self) -> UnhandledMessageMode {
        self.unhandled
    }

    pub fn validation(&self) -> ValidationMode {
        self.validation
    }

    /// Reject settings the consumer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::Configuration("Endpoint name must not be empty".into()));
        }
        if let Some(batch) = self.batch {
            if batch.size == 0 {
                return Err(BusError::Configuration(format!(
                    "Endpoint '{}': batch size must be at least 1",
                    self.name
                )));
            }
            if batch.max_wait.is_zero() {
                return Err(BusError::Configuration(format!(
                    "Endpoint '{}': batch max wait must be positive",
                    self.name
                )));
            }
        }
        if self.sequence_timeout.is_zero() {
            return Err(BusError::Configuration(format!(
                "Endpoint '{}': sequence timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Decrypt, deserialize and validate a non-null payload.
    pub fn decode(&self, envelope: &Envelope) -> Result<Option<M>> {
        let Some(payload) = envelope.payload() else {
            return Ok(None);
        };
        let message = match &self.encryption {
            Some(encryption) => {
                let plain = encryption.decrypt(payload, envelope.headers())?;
                self.serializer.deserialize(&plain, envelope.headers())?
            }
            None => self.serializer.deserialize(payload, envelope.headers())?,
        };
        validate_message(self.validator.as_deref(), self.validation, &message, &self.name)?;
        Ok(Some(message))
    }
}

impl<M> fmt::Debug for ConsumerEndpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerEndpoint")
            .field("name", &self.name)
            .field("batch", &self.batch)
            .field("sequence_timeout", &self.sequence_timeout)
            .field("error_policy", &self.error_policy)
            .field("exactly_once", &self.exactly_once.as_ref().map(|s| s.name().to_string()))
            .field("null_handling", &self.null_handling)
            .field("unhandled", &self.unhandled)
            .field("validation", &self.validation)
            .field("encryption", &self.encryption)
            .finish()
    }
}

// ============================================================================
// Producer endpoint
// ============================================================================

type KeyFn<M> = Arc<dyn Fn(&M) -> Option<String> + Send + Sync>;

/// Outbound endpoint configuration.
pub struct ProducerEndpoint<M> {
    name: Arc<str>,
    serializer: Arc<dyn MessageSerializer<M>>,
    encryption: Option<EncryptionSettings>,
    validator: Option<Arc<dyn MessageValidator<M>>>,
    validation: ValidationMode,
    chunk_size: Option<usize>,
    key: Option<KeyFn<M>>,
}

impl<M> ProducerEndpoint<M>
where
    M: BusMessage + Serialize + DeserializeOwned,
{
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_serializer(name, Arc::new(JsonSerializer::<M>::new()))
    }
}

impl<M: BusMessage> ProducerEndpoint<M> {
    pub fn with_serializer(name: impl Into<Arc<str>>, serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        Self {
            name: name.into(),
            serializer,
            encryption: None,
            validator: None,
            validation: ValidationMode::default(),
            chunk_size: None,
            key: None,
        }
    }

    /// Split payloads larger than `size` bytes into chunks.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionSettings) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_validation(mut self, validator: Arc<dyn MessageValidator<M>>, mode: ValidationMode) -> Self {
        self.validator = Some(validator);
        self.validation = mode;
        self
    }

    /// Derive the partitioning key (`x-message-key`) from the message.
    pub fn with_message_key(mut self, key: impl Fn(&M) -> Option<String> + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::Configuration("Endpoint name must not be empty".into()));
        }
        if self.chunk_size == Some(0) {
            return Err(BusError::Configuration(format!(
                "Endpoint '{}': chunk size must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    /// Turn a message into the envelopes to produce, in order.
    ///
    /// Validates, serializes, encrypts, assigns `x-message-id` and splits into
    /// chunks when the payload exceeds the chunk size.
    pub fn envelopes(&self, message: &M) -> Result<Vec<Envelope>> {
        validate_message(self.validator.as_deref(), self.validation, message, &self.name)?;

        let mut headers = MessageHeaders::new();
        let mut payload = self.serializer.serialize(message, &mut headers)?;
        if let Some(encryption) = &self.encryption {
            payload = encryption.encrypt(&payload, &mut headers)?;
        }
        if !headers.contains(MESSAGE_ID_HEADER) {
            headers.insert(MESSAGE_ID_HEADER, new_message_id());
        }
        if let Some(key) = self.key.as_ref().and_then(|f| f(message)) {
            headers.insert(MESSAGE_KEY_HEADER, key);
        }

        match self.chunk_size {
            Some(size) if payload.len() > size => Ok(split_into_chunks(&self.name, &headers, &payload, size)),
            _ => Ok(vec![Envelope::outbound(Arc::clone(&self.name), headers, Some(payload))]),
        }
    }
}

impl<M> fmt::Debug for ProducerEndpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerEndpoint")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("validation", &self.validation)
            .field("encryption", &self.encryption)
            .finish()
    }
}
