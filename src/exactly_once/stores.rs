//! Offset store and inbound log implementations.
//!
//! The file-backed variants keep the whole state in memory and rewrite a JSON
//! file on every change, atomically via a temp file and rename.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{InboundLog, OffsetStore};
use crate::bus::{BusError, Result};

/// Last stored position per endpoint and stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OffsetData {
    positions: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    version: u32,
}

impl OffsetData {
    fn get(&self, endpoint: &str, stream: &str) -> Option<u64> {
        self.positions.get(endpoint)?.get(stream).copied()
    }

    /// Returns whether anything advanced.
    fn advance(&mut self, endpoint: &str, positions: &[(String, u64)]) -> bool {
        let streams = self.positions.entry(endpoint.to_string()).or_default();
        let mut changed = false;
        for (stream, position) in positions {
            match streams.get_mut(stream) {
                Some(current) if *current >= *position => {}
                Some(current) => {
                    *current = *position;
                    changed = true;
                }
                None => {
                    streams.insert(stream.clone(), *position);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Processed message ids per endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InboundLogData {
    entries: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    version: u32,
}

fn store_error(path: &Path, e: impl std::fmt::Display) -> BusError {
    BusError::Store(format!("{}: {}", path.display(), e))
}

async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !tokio::fs::try_exists(path).await.map_err(|e| store_error(path, e))? {
        debug!(path = %path.display(), "Store file not found, starting fresh");
        return Ok(T::default());
    }
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| store_error(path, e))?;
    serde_json::from_str(&contents).map_err(|e| store_error(path, e))
}

async fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(|e| store_error(path, e))?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, &json)
        .await
        .map_err(|e| store_error(&temp_path, e))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| store_error(path, e))
}

// ============================================================================
// Offset stores
// ============================================================================

/// Volatile offset store.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    data: RwLock<OffsetData>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn last_position(&self, endpoint: &str, stream: &str) -> Result<Option<u64>> {
        Ok(self.data.read().await.get(endpoint, stream))
    }

    async fn store(&self, endpoint: &str, positions: &[(String, u64)]) -> Result<()> {
        self.data.write().await.advance(endpoint, positions);
        Ok(())
    }
}

/// Offset store persisted to a JSON file.
pub struct FileOffsetStore {
    path: PathBuf,
    data: RwLock<OffsetData>,
}

impl FileOffsetStore {
    /// Open the store, loading the file when it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data: OffsetData = load_json(&path).await?;
        info!(
            path = %path.display(),
            endpoints = data.positions.len(),
            "Loaded offset store"
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn last_position(&self, endpoint: &str, stream: &str) -> Result<Option<u64>> {
        Ok(self.data.read().await.get(endpoint, stream))
    }

    async fn store(&self, endpoint: &str, positions: &[(String, u64)]) -> Result<()> {
        let mut data = self.data.write().await;
        let mut updated = data.clone();
        if !updated.advance(endpoint, positions) {
            return Ok(());
        }
        write_json(&self.path, &updated).await?;
        *data = updated;
        debug!(path = %self.path.display(), endpoint = %endpoint, "Flushed offsets");
        Ok(())
    }
}

// ============================================================================
// Inbound logs
// ============================================================================

/// Volatile inbound log.
#[derive(Default)]
pub struct InMemoryInboundLog {
    data: RwLock<InboundLogData>,
}

impl InMemoryInboundLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, endpoint: &str) -> usize {
        self.data
            .read()
            .await
            .entries
            .get(endpoint)
            .map_or(0, BTreeSet::len)
    }
}

#[async_trait]
impl InboundLog for InMemoryInboundLog {
    async fn contains(&self, endpoint: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .data
            .read()
            .await
            .entries
            .get(endpoint)
            .is_some_and(|ids| ids.contains(message_id)))
    }

    async fn add(&self, endpoint: &str, message_ids: &[String]) -> Result<()> {
        self.data
            .write()
            .await
            .entries
            .entry(endpoint.to_string())
            .or_default()
            .extend(message_ids.iter().cloned());
        Ok(())
    }
}

/// Inbound log persisted to a JSON file.
pub struct FileInboundLog {
    path: PathBuf,
    data: RwLock<InboundLogData>,
}

impl FileInboundLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data: InboundLogData = load_json(&path).await?;
        info!(
            path = %path.display(),
            endpoints = data.entries.len(),
            "Loaded inbound log"
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InboundLog for FileInboundLog {
    async fn contains(&self, endpoint: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .data
            .read()
            .await
            .entries
            .get(endpoint)
            .is_some_and(|ids| ids.contains(message_id)))
    }

    async fn add(&self, endpoint: &str, message_ids: &[String]) -> Result<()> {
        let mut data = self.data.write().await;
        let mut updated = data.clone();
        updated
            .entries
            .entry(endpoint.to_string())
            .or_default()
            .extend(message_ids.iter().cloned());
        write_json(&self.path, &updated).await?;
        *data = updated;
        debug!(path = %self.path.display(), endpoint = %endpoint, added = message_ids.len(), "Flushed inbound log");
        Ok(())
    }
}
