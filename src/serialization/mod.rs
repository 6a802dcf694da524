//! Message serialization, encryption and validation seams.
//!
//! The core never assumes a wire format. Endpoints carry a
//! [`MessageSerializer`]; [`JsonSerializer`] is the default, built on serde.
//! Encryption and validation are optional per endpoint.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{BoxError, BusError, Result};
use crate::envelope::{MessageHeaders, CONTENT_TYPE_HEADER, MESSAGE_TYPE_HEADER};

/// Application message type carried by the bus.
///
/// Usually a closed enum of every message the application exchanges; the type
/// tag resolves subscribed handlers and outbound routes.
pub trait BusMessage: Send + Sync + 'static {
    /// Stable type tag, written to the `x-message-type` header.
    fn message_type(&self) -> &str;
}

/// Converts messages to and from raw payloads.
pub trait MessageSerializer<M>: Send + Sync {
    /// Serialize a message. May add headers (content type, type tag).
    fn serialize(&self, message: &M, headers: &mut MessageHeaders) -> Result<Vec<u8>>;

    /// Deserialize a payload using the received headers.
    fn deserialize(&self, payload: &[u8], headers: &MessageHeaders) -> Result<M>;
}

/// JSON serializer backed by serde_json.
pub struct JsonSerializer<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonSerializer<M> {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for JsonSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageSerializer<M> for JsonSerializer<M>
where
    M: BusMessage + Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &M, headers: &mut MessageHeaders) -> Result<Vec<u8>> {
        headers.insert(CONTENT_TYPE_HEADER, Self::CONTENT_TYPE);
        headers.insert(MESSAGE_TYPE_HEADER, message.message_type());
        serde_json::to_vec(message).map_err(|e| BusError::Serialization(e.to_string()))
    }

    fn deserialize(&self, payload: &[u8], headers: &MessageHeaders) -> Result<M> {
        if let Some(content_type) = headers.get(CONTENT_TYPE_HEADER) {
            if content_type != Self::CONTENT_TYPE {
                return Err(BusError::Serialization(format!(
                    "Unsupported content type '{}'",
                    content_type
                )));
            }
        }
        serde_json::from_slice(payload).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

// ============================================================================
// Encryption
// ============================================================================

/// Symmetric payload transformation applied after serialization (outbound)
/// and before deserialization (inbound).
pub trait PayloadCipher: Send + Sync {
    /// Key identifier, written to the `x-encryption-key-id` header.
    fn key_id(&self) -> &str;

    fn encrypt(&self, plain: &[u8]) -> std::result::Result<Vec<u8>, BoxError>;

    fn decrypt(&self, cipher: &[u8], key_id: Option<&str>) -> std::result::Result<Vec<u8>, BoxError>;
}

/// Header carrying the key id a payload was encrypted with.
pub const ENCRYPTION_KEY_ID_HEADER: &str = "x-encryption-key-id";

/// Encryption settings attached to an endpoint.
#[derive(Clone)]
pub struct EncryptionSettings {
    cipher: Arc<dyn PayloadCipher>,
}

impl EncryptionSettings {
    pub fn new(cipher: Arc<dyn PayloadCipher>) -> Self {
        Self { cipher }
    }

    pub fn encrypt(&self, plain: &[u8], headers: &mut MessageHeaders) -> Result<Vec<u8>> {
        headers.insert(ENCRYPTION_KEY_ID_HEADER, self.cipher.key_id());
        self.cipher
            .encrypt(plain)
            .map_err(|e| BusError::Serialization(format!("Encryption failed: {}", e)))
    }

    pub fn decrypt(&self, cipher: &[u8], headers: &MessageHeaders) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(cipher, headers.get(ENCRYPTION_KEY_ID_HEADER))
            .map_err(|e| BusError::Serialization(format!("Decryption failed: {}", e)))
    }
}

impl fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("key_id", &self.cipher.key_id())
            .finish()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// What to do with a message that fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Validation disabled.
    None,
    /// Log a warning and keep going.
    #[default]
    LogWarning,
    /// Fail with `BusError::Validation`.
    ThrowException,
}

/// Validates a message, returning the list of violations.
pub trait MessageValidator<M>: Send + Sync {
    fn validate(&self, message: &M) -> std::result::Result<(), Vec<String>>;
}

/// Apply `mode` using `validator`.
pub fn validate_message<M: BusMessage>(
    validator: Option<&dyn MessageValidator<M>>,
    mode: ValidationMode,
    message: &M,
    endpoint: &str,
) -> Result<()> {
    let Some(validator) = validator else {
        return Ok(());
    };
    if mode == ValidationMode::None {
        return Ok(());
    }
    match validator.validate(message) {
        Ok(()) => Ok(()),
        Err(violations) => {
            let joined = violations.join("; ");
            match mode {
                ValidationMode::ThrowException => Err(BusError::Validation(joined)),
                _ => {
                    warn!(
                        endpoint = %endpoint,
                        message_type = %message.message_type(),
                        violations = %joined,
                        "Invalid message"
                    );
                    Ok(())
                }
            }
        }
    }
}
