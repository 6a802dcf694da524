//! Application handlers and the registry resolving them by message type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::transaction::Transaction;
use crate::bus::BoxError;
use crate::envelope::Envelope;
use crate::sequence::SequenceKind;
use crate::serialization::BusMessage;

/// Decoded body of an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody<M> {
    Message(M),
    /// Null payload delivered as a deletion marker for `key`.
    Tombstone { key: Option<String> },
    /// Null payload forwarded as-is.
    Null,
}

/// A decoded message together with the envelope it arrived in.
#[derive(Debug, Clone)]
pub struct Delivered<M> {
    envelope: Envelope,
    body: MessageBody<M>,
}

impl<M: BusMessage> Delivered<M> {
    pub fn new(envelope: Envelope, body: MessageBody<M>) -> Self {
        Self { envelope, body }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn body(&self) -> &MessageBody<M> {
        &self.body
    }

    pub fn message(&self) -> Option<&M> {
        match &self.body {
            MessageBody::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Type tag used for subscription lookup. Null bodies fall back to the
    /// `x-message-type` header.
    pub fn message_type(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Message(m) => Some(m.message_type()),
            _ => self.envelope.message_type(),
        }
    }
}

/// What the handler is being invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceInfo {
    pub kind: SequenceKind,
    pub key: String,
    /// Messages in the unit, duplicates included.
    pub size: usize,
}

/// Per-invocation context passed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    endpoint: Arc<str>,
    sequence: SequenceInfo,
    attempt: u32,
    transaction: Option<Arc<dyn Transaction>>,
}

impl HandlerContext {
    pub fn new(
        endpoint: Arc<str>,
        sequence: SequenceInfo,
        attempt: u32,
        transaction: Option<Arc<dyn Transaction>>,
    ) -> Self {
        Self {
            endpoint,
            sequence,
            attempt,
            transaction,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn sequence(&self) -> &SequenceInfo {
        &self.sequence
    }

    /// 1 on first delivery, incremented on every in-process retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Transaction begun for this unit, when the consumer has a factory.
    pub fn transaction(&self) -> Option<&dyn Transaction> {
        self.transaction.as_deref()
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("endpoint", &self.endpoint)
            .field("sequence", &self.sequence)
            .field("attempt", &self.attempt)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id().to_string()))
            .finish()
    }
}

/// Application callback subscribed to one or more message types.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    fn name(&self) -> &str;

    /// Handle the messages of one unit this handler subscribes to, in arrival order.
    async fn handle(&self, messages: &[&Delivered<M>], context: &HandlerContext) -> Result<(), BoxError>;
}

/// Subscriptions by message type.
pub struct HandlerRegistry<M> {
    by_type: HashMap<String, Vec<Arc<dyn MessageHandler<M>>>>,
    wildcard: Vec<Arc<dyn MessageHandler<M>>>,
}

impl<M> Default for HandlerRegistry<M> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            wildcard: Vec::new(),
        }
    }
}

impl<M: BusMessage> HandlerRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `message_type`.
    pub fn subscribe(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler<M>>) -> Self {
        self.by_type.entry(message_type.into()).or_default().push(handler);
        self
    }

    /// Subscribe `handler` to every message type.
    pub fn subscribe_all(mut self, handler: Arc<dyn MessageHandler<M>>) -> Self {
        self.wildcard.push(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.wildcard.is_empty()
    }

    /// Handlers for a type tag: typed subscriptions first, then wildcards.
    pub fn handlers_for(&self, message_type: Option<&str>) -> Vec<Arc<dyn MessageHandler<M>>> {
        let mut handlers: Vec<Arc<dyn MessageHandler<M>>> = message_type
            .and_then(|t| self.by_type.get(t))
            .cloned()
            .unwrap_or_default();
        for handler in &self.wildcard {
            if !handlers.iter().any(|h| Arc::ptr_eq(h, handler)) {
                handlers.push(Arc::clone(handler));
            }
        }
        handlers
    }

    /// Group a unit's messages by handler, preserving first-subscription order.
    ///
    /// Returns the plan and the messages nobody subscribes to.
    pub fn plan<'a>(&self, messages: &'a [Delivered<M>]) -> (DispatchPlan<'a, M>, Vec<&'a Delivered<M>>) {
        let mut plan: DispatchPlan<'a, M> = Vec::new();
        let mut unhandled = Vec::new();

        for delivered in messages {
            let handlers = self.handlers_for(delivered.message_type());
            if handlers.is_empty() {
                unhandled.push(delivered);
                continue;
            }
            for handler in handlers {
                match plan.iter_mut().find(|(h, _)| Arc::ptr_eq(h, &handler)) {
                    Some((_, subset)) => subset.push(delivered),
                    None => plan.push((handler, vec![delivered])),
                }
            }
        }

        (plan, unhandled)
    }
}

/// Handlers paired with the messages each one receives.
pub type DispatchPlan<'a, M> = Vec<(Arc<dyn MessageHandler<M>>, Vec<&'a Delivered<M>>)>;
