//! Inbound consumer.
//!
//! Turns a transport's stream of envelopes into handler invocations with
//! reliable commits:
//!
//! receive → accumulate → exactly-once filter → dispatch → commit,
//! or error policy chain → retry / skip / move / disconnect.
//!
//! Lifecycle: `InboundConsumer::new` (Unbound) → `bind` (Bound) → `start`
//! (Listening, owned by a spawned task reachable through [`ConsumerHandle`]).

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::{Broker, BusError, Consumer, Result};
use crate::endpoint::ConsumerEndpoint;
use crate::error_policy::RetryContextStore;
use crate::sequence::SequenceAccumulator;
use crate::serialization::BusMessage;
use crate::utils::bootstrap::connect_with_retry;

mod commit;
mod handler;
mod transaction;
mod worker;

pub use commit::CommitTracker;
pub use handler::{
    Delivered, DispatchPlan, HandlerContext, HandlerRegistry, MessageBody, MessageHandler, SequenceInfo,
};
pub use transaction::{Transaction, TransactionFactory};

use worker::ConsumerWorker;

/// Consumer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unbound,
    Bound,
    Listening,
    Dispatching,
    /// Terminal.
    Disconnected,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Dispatching => "dispatching",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer for one endpoint, before it starts running.
pub struct InboundConsumer<M> {
    broker: Arc<dyn Broker>,
    endpoint: Arc<ConsumerEndpoint<M>>,
    registry: Arc<HandlerRegistry<M>>,
    transactions: Option<Arc<dyn TransactionFactory>>,
    transport: Option<Arc<dyn Consumer>>,
    state: watch::Sender<ConsumerState>,
}

impl<M: BusMessage> InboundConsumer<M> {
    pub fn new(broker: Arc<dyn Broker>, endpoint: ConsumerEndpoint<M>, registry: HandlerRegistry<M>) -> Self {
        Self {
            broker,
            endpoint: Arc::new(endpoint),
            registry: Arc::new(registry),
            transactions: None,
            transport: None,
            state: watch::Sender::new(ConsumerState::Unbound),
        }
    }

    /// Begin a transaction around every dispatch unit.
    pub fn with_transactions(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transactions = Some(factory);
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn endpoint(&self) -> &ConsumerEndpoint<M> {
        &self.endpoint
    }

    /// Validate the endpoint, connect the broker and obtain a transport consumer.
    ///
    /// Any failure leaves the consumer Disconnected.
    pub async fn bind(&mut self) -> Result<()> {
        let current = self.state();
        if current != ConsumerState::Unbound {
            return Err(BusError::Configuration(format!(
                "Consumer for '{}' cannot bind while {}",
                self.endpoint.name(),
                current
            )));
        }

        match self.open_transport().await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state.send_replace(ConsumerState::Bound);
                info!(endpoint = %self.endpoint.name(), broker = %self.broker.name(), "Consumer bound");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConsumerState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_transport(&self) -> Result<Arc<dyn Consumer>> {
        self.endpoint.validate()?;
        if self.registry.is_empty() {
            return Err(BusError::Configuration(format!(
                "Endpoint '{}' has no subscribed handlers",
                self.endpoint.name()
            )));
        }

        if !self.broker.is_connected() {
            let broker = Arc::clone(&self.broker);
            connect_with_retry(self.broker.name(), self.endpoint.name(), || {
                let broker = Arc::clone(&broker);
                async move { broker.connect().await }
            })
            .await?;
        }
        self.broker.consumer(self.endpoint.name()).await
    }

    /// Spawn the consumer loop.
    pub fn start(self) -> Result<ConsumerHandle> {
        let name = self.endpoint.name_arc();
        let transport = match (self.state(), self.transport) {
            (ConsumerState::Bound, Some(transport)) => transport,
            (state, _) => {
                return Err(BusError::Configuration(format!(
                    "Consumer for '{}' must be bound before start (currently {})",
                    name, state
                )))
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state_rx = self.state.subscribe();
        let worker = ConsumerWorker {
            accumulator: SequenceAccumulator::new(
                Arc::clone(&name),
                self.endpoint.batch(),
                self.endpoint.sequence_timeout(),
            ),
            tracker: CommitTracker::new(transport.ack_mode()),
            endpoint: self.endpoint,
            name: Arc::clone(&name),
            registry: self.registry,
            transport,
            transactions: self.transactions,
            state: self.state,
            cancel: cancel_rx,
            retries: RetryContextStore::new(),
            receive_failing: false,
        };

        let task = tokio::spawn(worker.run());
        Ok(ConsumerHandle {
            endpoint: name,
            state: state_rx,
            cancel: cancel_tx,
            task,
        })
    }
}

/// Handle to a running consumer.
///
/// Dropping the handle requests shutdown, like [`ConsumerHandle::stop`]
/// without waiting for it.
pub struct ConsumerHandle {
    endpoint: Arc<str>,
    state: watch::Receiver<ConsumerState>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the consumer reaches `state`.
    ///
    /// Fails with `Disconnected` if the consumer stops without reaching it.
    pub async fn wait_for(&mut self, state: ConsumerState) -> Result<()> {
        let endpoint = Arc::clone(&self.endpoint);
        self.state
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Disconnected(endpoint.to_string()))
    }

    /// Request a graceful shutdown and wait for it.
    ///
    /// The in-flight dispatch completes; open sequences are rolled back.
    pub async fn stop(self) -> Result<()> {
        self.cancel.send_replace(true);
        self.join().await
    }

    /// Wait for the consumer to stop on its own.
    ///
    /// Returns the fatal error that disconnected it, if any.
    pub async fn join(self) -> Result<()> {
        let Self {
            endpoint,
            cancel: _cancel,
            task,
            ..
        } = self;
        task.await
            .map_err(|e| BusError::Disconnected(format!("{} ({})", endpoint, e)))?
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
