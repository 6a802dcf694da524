//! Outbound router.
//!
//! Maps a message type to one or more target endpoints and produces the
//! message to each of them. Targets are independent: a failure on one never
//! retries or undoes the others, and the caller gets a per-target report.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{Broker, BusError, Producer, Result};
use crate::endpoint::ProducerEndpoint;
use crate::envelope::Offset;
use crate::serialization::BusMessage;

type RouteFn<M> = Arc<dyn Fn(&M) -> Vec<String> + Send + Sync>;

/// How a message type selects its targets.
pub enum RoutingRule<M> {
    /// Fixed targets, resolved at configuration time.
    Static(Vec<String>),
    /// Targets computed from the message on every publish.
    Dynamic(RouteFn<M>),
}

impl<M> RoutingRule<M> {
    /// Single static target.
    pub fn to(endpoint: impl Into<String>) -> Self {
        Self::Static(vec![endpoint.into()])
    }

    /// Static broadcast to every listed endpoint.
    pub fn broadcast<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Static(endpoints.into_iter().map(Into::into).collect())
    }

    pub fn dynamic(route: impl Fn(&M) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(route))
    }

    /// Targets for `message`, deduplicated in first-seen order.
    fn targets(&self, message: &M) -> Vec<String> {
        let candidates = match self {
            Self::Static(endpoints) => endpoints.clone(),
            Self::Dynamic(route) => route(message),
        };
        let mut targets: Vec<String> = Vec::with_capacity(candidates.len());
        for endpoint in candidates {
            if !targets.contains(&endpoint) {
                targets.push(endpoint);
            }
        }
        targets
    }
}

impl<M> fmt::Debug for RoutingRule<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(endpoints) => f.debug_tuple("Static").field(endpoints).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Result of producing to one target.
#[derive(Debug)]
pub struct TargetOutcome {
    pub endpoint: String,
    /// Offsets of every produced envelope (several when chunked).
    pub result: Result<Vec<Offset>>,
}

/// Aggregate result of one publish.
#[derive(Debug, Default)]
pub struct RoutingReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl RoutingReport {
    pub fn is_complete_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> Vec<(&str, &BusError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.endpoint.as_str(), e)))
            .collect()
    }

    /// Offsets produced to `endpoint`, if it succeeded.
    pub fn offsets(&self, endpoint: &str) -> Option<&[Offset]> {
        self.outcomes
            .iter()
            .find(|o| o.endpoint == endpoint)
            .and_then(|o| o.result.as_deref().ok())
    }
}

/// Routes outgoing messages to producer endpoints.
pub struct OutboundRouter<M> {
    broker: Arc<dyn Broker>,
    routes: HashMap<String, RoutingRule<M>>,
    endpoints: HashMap<String, Arc<ProducerEndpoint<M>>>,
    producers: RwLock<HashMap<String, Arc<dyn Producer>>>,
}

impl<M: BusMessage> OutboundRouter<M> {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            routes: HashMap::new(),
            endpoints: HashMap::new(),
            producers: RwLock::new(HashMap::new()),
        }
    }

    /// Route `message_type` with `rule`, replacing any previous rule.
    pub fn route(mut self, message_type: impl Into<String>, rule: RoutingRule<M>) -> Self {
        self.routes.insert(message_type.into(), rule);
        self
    }

    /// Register the configuration used to produce to an endpoint.
    pub fn register_endpoint(mut self, endpoint: ProducerEndpoint<M>) -> Self {
        self.endpoints.insert(endpoint.name().to_string(), Arc::new(endpoint));
        self
    }

    /// Validate endpoints and instantiate a producer for every registered one.
    pub async fn preload(&self) -> Result<()> {
        for endpoint in self.endpoints.values() {
            endpoint.validate()?;
            self.producer(endpoint.name()).await?;
        }
        for (message_type, rule) in &self.routes {
            if let RoutingRule::Static(targets) = rule {
                for target in targets {
                    if !self.endpoints.contains_key(target) {
                        return Err(BusError::Configuration(format!(
                            "Route for '{}' targets unregistered endpoint '{}'",
                            message_type, target
                        )));
                    }
                }
            }
        }
        info!(
            broker = %self.broker.name(),
            producers = self.producers.read().await.len(),
            "Outbound producers preloaded"
        );
        Ok(())
    }

    /// Produce `message` to every target of its route.
    ///
    /// Fails only when the message type has no route; per-target failures are
    /// reported in the returned [`RoutingReport`].
    #[tracing::instrument(name = "outbound.publish", skip_all, fields(message_type = %message.message_type()))]
    pub async fn publish(&self, message: &M) -> Result<RoutingReport> {
        let message_type = message.message_type();
        let rule = self.routes.get(message_type).ok_or_else(|| {
            BusError::Configuration(format!("No route for message type '{}'", message_type))
        })?;

        let targets = rule.targets(message);
        if targets.is_empty() {
            debug!(message_type = %message_type, "Route selected no targets");
            return Ok(RoutingReport::default());
        }

        let outcomes = join_all(targets.into_iter().map(|endpoint| async move {
            let result = self.produce_to(&endpoint, message).await;
            if let Err(e) = &result {
                warn!(endpoint = %endpoint, error = %e, "Publish to target failed");
            }

            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{self, OUTBOUND_PUBLISH_TOTAL};
                let outcome = if result.is_ok() { "success" } else { "failure" };
                OUTBOUND_PUBLISH_TOTAL.add(
                    1,
                    &[metrics::endpoint_attr(&endpoint), metrics::outcome_attr(outcome)],
                );
            }

            TargetOutcome { endpoint, result }
        }))
        .await;

        Ok(RoutingReport { outcomes })
    }

    async fn produce_to(&self, endpoint: &str, message: &M) -> Result<Vec<Offset>> {
        let config = self.endpoints.get(endpoint).ok_or_else(|| {
            BusError::Configuration(format!("Producer endpoint '{}' is not registered", endpoint))
        })?;
        let envelopes = config.envelopes(message)?;
        let producer = self.producer(endpoint).await?;

        let mut offsets = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            offsets.push(producer.produce(envelope).await?);
        }
        debug!(endpoint = %endpoint, envelopes = offsets.len(), "Published");
        Ok(offsets)
    }

    async fn producer(&self, endpoint: &str) -> Result<Arc<dyn Producer>> {
        if let Some(producer) = self.producers.read().await.get(endpoint) {
            return Ok(Arc::clone(producer));
        }

        let mut producers = self.producers.write().await;
        if let Some(producer) = producers.get(endpoint) {
            return Ok(Arc::clone(producer));
        }
        let producer = self.broker.producer(endpoint).await?;
        producers.insert(endpoint.to_string(), Arc::clone(&producer));
        debug!(endpoint = %endpoint, "Producer created");
        Ok(producer)
    }
}

#[cfg(test)]
mod tests;
