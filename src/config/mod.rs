//! Declarative bus configuration.
//!
//! Endpoint options can be kept in YAML and turned into runtime endpoints:
//!
//! ```yaml
//! broker:
//!   partitions: 4
//!   ack_mode: cumulative
//! endpoints:
//!   - name: orders
//!     batch_size: 50
//!     batch_max_wait_ms: 2000
//!     exactly_once:
//!       kind: offset_store
//!       path: ./data/offsets.json
//!     error_policies:
//!       - type: retry
//!         attempts: 3
//!         initial_delay_ms: 100
//!       - type: move
//!         target: orders.dlq
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{AckMode, Broker, BusError, ErrorKind, InMemoryBroker, InMemoryConfig, Result};
use crate::endpoint::{ConsumerEndpoint, NullMessageHandling, ProducerEndpoint, UnhandledMessageMode};
use crate::error_policy::{ErrorPolicy, ErrorPolicyChain, Fatal, Move, Retry, Skip};
use crate::exactly_once::{
    ExactlyOnceStrategy, FileInboundLog, FileOffsetStore, InMemoryInboundLog, InMemoryOffsetStore,
    InboundLogStrategy, OffsetStoreStrategy,
};
use crate::serialization::{BusMessage, MessageValidator, ValidationMode};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// In-memory broker settings.
    pub broker: BrokerSettings,
    pub endpoints: Vec<EndpointSettings>,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder =
            ConfigLib::builder().add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: BusConfig = config.try_deserialize().map_err(config_error)?;
        debug!(endpoints = config.endpoints.len(), "Loaded bus configuration");
        Ok(config)
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(config_error)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointSettings> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

fn config_error(e: impl std::fmt::Display) -> BusError {
    BusError::Configuration(e.to_string())
}

/// Settings for the bundled in-memory broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub partitions: usize,
    pub ack_mode: AckMode,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            partitions: 1,
            ack_mode: AckMode::Individual,
        }
    }
}

impl BrokerSettings {
    pub fn in_memory_broker(&self) -> InMemoryBroker {
        InMemoryBroker::new(InMemoryConfig {
            partitions: self.partitions.max(1),
            ack_mode: self.ack_mode,
        })
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Every recognized endpoint option.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub name: String,
    /// Batch size; batching is enabled when both size and max wait are set.
    pub batch_size: Option<usize>,
    pub batch_max_wait_ms: Option<u64>,
    pub sequence_timeout_secs: Option<u64>,
    pub null_handling: NullMessageHandling,
    pub unhandled: UnhandledMessageMode,
    /// Applied together with the validator passed to `build_consumer`/`build_producer`.
    pub validation: ValidationMode,
    pub exactly_once: Option<ExactlyOnceSettings>,
    pub error_policies: Vec<ErrorPolicySettings>,
    /// Outbound chunk size in bytes.
    pub chunk_size: Option<usize>,
}

impl EndpointSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build a consumer endpoint, resolving move targets through `broker`.
    pub async fn build_consumer<M>(
        &self,
        broker: &dyn Broker,
        validator: Option<Arc<dyn MessageValidator<M>>>,
    ) -> Result<ConsumerEndpoint<M>>
    where
        M: BusMessage + Serialize + DeserializeOwned,
    {
        let mut endpoint = ConsumerEndpoint::<M>::new(self.name.as_str())
            .with_null_handling(self.null_handling)
            .with_unhandled(self.unhandled);

        match (self.batch_size, self.batch_max_wait_ms) {
            (Some(size), Some(wait_ms)) => {
                endpoint = endpoint.with_batch(size, Duration::from_millis(wait_ms));
            }
            (None, None) => {}
            _ => {
                return Err(BusError::Configuration(format!(
                    "Endpoint '{}': batch_size and batch_max_wait_ms must be set together",
                    self.name
                )))
            }
        }
        if let Some(secs) = self.sequence_timeout_secs {
            endpoint = endpoint.with_sequence_timeout(Duration::from_secs(secs));
        }
        if let Some(validator) = validator {
            endpoint = endpoint.with_validation(validator, self.validation);
        }
        if let Some(strategy) = &self.exactly_once {
            endpoint = endpoint.with_exactly_once(strategy.build().await?);
        }

        let mut chain = ErrorPolicyChain::new();
        for policy in &self.error_policies {
            chain.push(policy.build(broker).await?);
        }
        let endpoint = endpoint.with_error_policy(chain);
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn build_producer<M>(&self, validator: Option<Arc<dyn MessageValidator<M>>>) -> Result<ProducerEndpoint<M>>
    where
        M: BusMessage + Serialize + DeserializeOwned,
    {
        let mut endpoint = ProducerEndpoint::<M>::new(self.name.as_str());
        if let Some(size) = self.chunk_size {
            endpoint = endpoint.with_chunk_size(size);
        }
        if let Some(validator) = validator {
            endpoint = endpoint.with_validation(validator, self.validation);
        }
        endpoint.validate()?;
        Ok(endpoint)
    }
}

// ============================================================================
// Exactly-once
// ============================================================================

/// Deduplication strategy. Without a path the store is kept in memory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExactlyOnceSettings {
    OffsetStore {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    InboundLog {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl ExactlyOnceSettings {
    pub async fn build(&self) -> Result<Arc<dyn ExactlyOnceStrategy>> {
        let strategy: Arc<dyn ExactlyOnceStrategy> = match self {
            Self::OffsetStore { path: Some(path) } => {
                Arc::new(OffsetStoreStrategy::new(Arc::new(FileOffsetStore::open(path).await?)))
            }
            Self::OffsetStore { path: None } => Arc::new(OffsetStoreStrategy::new(Arc::new(InMemoryOffsetStore::new()))),
            Self::InboundLog { path: Some(path) } => {
                Arc::new(InboundLogStrategy::new(Arc::new(FileInboundLog::open(path).await?)))
            }
            Self::InboundLog { path: None } => Arc::new(InboundLogStrategy::new(Arc::new(InMemoryInboundLog::new()))),
        };
        Ok(strategy)
    }
}

// ============================================================================
// Error policies
// ============================================================================

/// Filter options shared by every policy kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSettings {
    pub max_failed_attempts: Option<u32>,
    pub apply_to: Vec<ErrorKind>,
    pub exclude: Vec<ErrorKind>,
}

fn default_factor() -> f32 {
    2.0
}

/// One entry of an endpoint's error policy chain.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPolicySettings {
    Retry {
        attempts: u32,
        #[serde(default)]
        initial_delay_ms: u64,
        #[serde(default = "default_factor")]
        factor: f32,
        #[serde(default)]
        max_delay_ms: Option<u64>,
        #[serde(default)]
        jitter: bool,
        #[serde(default)]
        filter: FilterSettings,
    },
    Skip {
        #[serde(default)]
        filter: FilterSettings,
    },
    Move {
        target: String,
        #[serde(default)]
        filter: FilterSettings,
    },
    Fatal {
        #[serde(default)]
        filter: FilterSettings,
    },
}

/// Apply a [`FilterSettings`] through a policy's filter builders.
macro_rules! filtered {
    ($policy:expr, $filter:expr) => {{
        let filter: &FilterSettings = $filter;
        let mut policy = $policy;
        if let Some(max) = filter.max_failed_attempts {
            policy = policy.max_failed_attempts(max);
        }
        if !filter.apply_to.is_empty() {
            policy = policy.apply_to(filter.apply_to.iter().copied());
        }
        if !filter.exclude.is_empty() {
            policy = policy.exclude(filter.exclude.iter().copied());
        }
        policy
    }};
}

impl ErrorPolicySettings {
    pub async fn build(&self, broker: &dyn Broker) -> Result<Arc<dyn ErrorPolicy>> {
        let policy: Arc<dyn ErrorPolicy> = match self {
            Self::Retry {
                attempts,
                initial_delay_ms,
                factor,
                max_delay_ms,
                jitter,
                filter,
            } => {
                let mut retry = Retry::attempts(*attempts)
                    .with_initial_delay(Duration::from_millis(*initial_delay_ms))
                    .with_factor(*factor);
                if let Some(ms) = max_delay_ms {
                    retry = retry.with_max_delay(Duration::from_millis(*ms));
                }
                if *jitter {
                    retry = retry.with_jitter();
                }
                Arc::new(filtered!(retry, filter))
            }
            Self::Skip { filter } => Arc::new(filtered!(Skip::new(), filter)),
            Self::Move { target, filter } => {
                let producer = broker.producer(target).await?;
                Arc::new(filtered!(Move::to(producer), filter))
            }
            Self::Fatal { filter } => Arc::new(filtered!(Fatal::new(), filter)),
        };
        Ok(policy)
    }
}
