//! In-memory broker for standalone mode and testing.
//!
//! Topics are split into partitions; each partition is an append-only log.
//! One consumer group per topic keeps its position across consumer restarts,
//! so rolled back or never acknowledged messages are redelivered exactly as a
//! real transport would.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{AckMode, Broker, BusError, Consumer, Producer, Result};
use crate::envelope::{Envelope, Offset};

/// Configuration for the in-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Partitions per topic.
    pub partitions: usize,
    /// Acknowledgment semantics emulated by consumers.
    pub ack_mode: AckMode,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            ack_mode: AckMode::Individual,
        }
    }
}

impl InMemoryConfig {
    /// Queue semantics: individual acks, nacked messages requeued at the front.
    pub fn queue() -> Self {
        Self::default()
    }

    /// Log semantics: cumulative commits, rollback seeks back.
    pub fn log(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            ack_mode: AckMode::Cumulative,
        }
    }
}

type Slot = (usize, u64);

#[derive(Default)]
struct GroupState {
    cursors: Vec<u64>,
    committed: Vec<Option<u64>>,
    acked: HashSet<Slot>,
    requeue: VecDeque<Slot>,
    next_partition: usize,
    closed: bool,
}

struct Topic {
    partitions: Vec<Vec<Envelope>>,
    group: GroupState,
    notify: Arc<Notify>,
    ack_history: Vec<Vec<Offset>>,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            group: GroupState {
                cursors: vec![0; partitions],
                committed: vec![None; partitions],
                ..Default::default()
            },
            notify: Arc::new(Notify::new()),
            ack_history: Vec::new(),
        }
    }

    /// Reset the group position to the last commit (consumer restart).
    fn rewind_to_committed(&mut self) {
        let group = &mut self.group;
        for (p, cursor) in group.cursors.iter_mut().enumerate() {
            *cursor = group.committed[p].map(|c| c + 1).unwrap_or(0);
        }
        group.requeue.clear();
        group.closed = false;
    }

    fn take_next(&mut self) -> Option<Envelope> {
        let partition_count = self.partitions.len();
        let group = &mut self.group;

        while let Some((p, pos)) = group.requeue.pop_front() {
            if !group.acked.contains(&(p, pos)) {
                return self.partitions[p].get(pos as usize).cloned();
            }
        }

        for step in 0..partition_count {
            let p = (group.next_partition + step) % partition_count;
            while (group.cursors[p] as usize) < self.partitions[p].len() {
                let pos = group.cursors[p];
                group.cursors[p] += 1;
                if group.acked.contains(&(p, pos)) {
                    continue;
                }
                group.next_partition = (p + 1) % partition_count;
                return self.partitions[p].get(pos as usize).cloned();
            }
        }
        None
    }
}

#[derive(Default)]
struct Faults {
    produce: HashMap<String, usize>,
    ack: HashMap<String, usize>,
    connect: usize,
}

struct Inner {
    config: InMemoryConfig,
    topics: Mutex<HashMap<String, Topic>>,
    faults: Mutex<Faults>,
}

impl Inner {
    fn stream_name(topic: &str, partition: usize) -> String {
        format!("{}[{}]", topic, partition)
    }

    fn partition_of(topic: &str, offset: &Offset) -> Option<usize> {
        let stream = offset.stream();
        let rest = stream.strip_prefix(topic)?.strip_prefix('[')?;
        rest.strip_suffix(']')?.parse().ok()
    }

    fn partition_for(&self, envelope: &Envelope) -> usize {
        match envelope.message_key() {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.config.partitions as u64) as usize
            }
            None => 0,
        }
    }

    fn take_fault(map: &mut HashMap<String, usize>, topic: &str) -> bool {
        match map.get_mut(topic) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory broker using per-topic partition logs.
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    connected: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(mut config: InMemoryConfig) -> Self {
        config.partitions = config.partitions.max(1);
        info!(
            partitions = config.partitions,
            ack_mode = ?config.ack_mode,
            "In-memory broker initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
            }),
            connected: AtomicBool::new(false),
        }
    }

    /// Queue-like broker with one partition.
    pub fn queue() -> Self {
        Self::new(InMemoryConfig::queue())
    }

    /// Make the next `times` productions to `topic` fail with a transport error.
    pub async fn fail_next_produce(&self, topic: &str, times: usize) {
        self.inner
            .faults
            .lock()
            .await
            .produce
            .insert(topic.to_string(), times);
    }

    /// Make the next `times` acknowledgments on `topic` fail.
    pub async fn fail_next_ack(&self, topic: &str, times: usize) {
        self.inner
            .faults
            .lock()
            .await
            .ack
            .insert(topic.to_string(), times);
    }

    /// Make the next `times` connection attempts fail.
    pub async fn fail_next_connect(&self, times: usize) {
        self.inner.faults.lock().await.connect = times;
    }

    /// Every envelope ever produced to `topic`, in partition then offset order.
    pub async fn messages(&self, topic: &str) -> Vec<Envelope> {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Each `acknowledge` call made on `topic`, in call order.
    pub async fn ack_calls(&self, topic: &str) -> Vec<Vec<Offset>> {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .map(|t| t.ack_history.clone())
            .unwrap_or_default()
    }

    /// All acknowledged offsets on `topic`, flattened in commit order.
    pub async fn acknowledged(&self, topic: &str) -> Vec<Offset> {
        self.ack_calls(topic).await.into_iter().flatten().collect()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut faults = self.inner.faults.lock().await;
            if faults.connect > 0 {
                faults.connect -= 1;
                return Err(BusError::Transport("Injected connect failure".to_string()));
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("In-memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut topics = self.inner.topics.lock().await;
        for topic in topics.values_mut() {
            topic.group.closed = true;
            topic.notify.notify_one();
        }
        debug!("In-memory broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn producer(&self, endpoint: &str) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(InMemoryProducer {
            endpoint: endpoint.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn consumer(&self, endpoint: &str) -> Result<Arc<dyn Consumer>> {
        if !self.is_connected() {
            return Err(BusError::Transport(format!(
                "Broker not connected, cannot consume '{}'",
                endpoint
            )));
        }

        let partitions = self.inner.config.partitions;
        let notify = {
            let mut topics = self.inner.topics.lock().await;
            let topic = topics
                .entry(endpoint.to_string())
                .or_insert_with(|| Topic::new(partitions));
            topic.rewind_to_committed();
            Arc::clone(&topic.notify)
        };

        Ok(Arc::new(InMemoryConsumer {
            endpoint: endpoint.to_string(),
            inner: Arc::clone(&self.inner),
            notify,
        }))
    }
}

struct InMemoryProducer {
    endpoint: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Producer for InMemoryProducer {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn produce(&self, envelope: Envelope) -> Result<Offset> {
        {
            let mut faults = self.inner.faults.lock().await;
            if Inner::take_fault(&mut faults.produce, &self.endpoint) {
                return Err(BusError::Transport(format!(
                    "Injected produce failure on '{}'",
                    self.endpoint
                )));
            }
        }

        let partition = self.inner.partition_for(&envelope);
        let partitions = self.inner.config.partitions;
        let mut topics = self.inner.topics.lock().await;
        let topic = topics
            .entry(self.endpoint.clone())
            .or_insert_with(|| Topic::new(partitions));

        let log = &mut topic.partitions[partition];
        let offset = Offset::position(Inner::stream_name(&self.endpoint, partition), log.len() as u64);
        let stored = Envelope::inbound(
            self.endpoint.as_str(),
            envelope.headers().clone(),
            envelope.payload().map(<[u8]>::to_vec),
            offset.clone(),
        );
        log.push(stored);
        topic.notify.notify_one();

        debug!(endpoint = %self.endpoint, offset = %offset, "Produced message");
        Ok(offset)
    }
}

struct InMemoryConsumer {
    endpoint: String,
    inner: Arc<Inner>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ack_mode(&self) -> AckMode {
        self.inner.config.ack_mode
    }

    async fn receive(&self) -> Result<Option<Envelope>> {
        loop {
            {
                let mut topics = self.inner.topics.lock().await;
                let topic = match topics.get_mut(&self.endpoint) {
                    Some(t) => t,
                    None => return Ok(None),
                };
                if topic.group.closed {
                    return Ok(None);
                }
                if let Some(envelope) = topic.take_next() {
                    return Ok(Some(envelope));
                }
            }
            self.notify.notified().await;
        }
    }

    async fn acknowledge(&self, offsets: &[Offset]) -> Result<()> {
        {
            let mut faults = self.inner.faults.lock().await;
            if Inner::take_fault(&mut faults.ack, &self.endpoint) {
                return Err(BusError::Transport(format!(
                    "Injected acknowledge failure on '{}'",
                    self.endpoint
                )));
            }
        }

        let mode = self.inner.config.ack_mode;
        let mut topics = self.inner.topics.lock().await;
        let topic = topics
            .get_mut(&self.endpoint)
            .ok_or_else(|| BusError::Transport(format!("Unknown topic '{}'", self.endpoint)))?;

        for offset in offsets {
            let (Some(p), Some(pos)) = (Inner::partition_of(&self.endpoint, offset), offset.as_position())
            else {
                warn!(endpoint = %self.endpoint, offset = %offset, "Ignoring foreign offset");
                continue;
            };
            match mode {
                AckMode::Individual => {
                    topic.group.acked.insert((p, pos));
                }
                AckMode::Cumulative => {
                    let committed = &mut topic.group.committed[p];
                    *committed = Some(committed.map_or(pos, |c| c.max(pos)));
                }
            }
        }
        topic.ack_history.push(offsets.to_vec());
        Ok(())
    }

    async fn rollback(&self, offsets: &[Offset]) -> Result<()> {
        let mode = self.inner.config.ack_mode;
        let mut topics = self.inner.topics.lock().await;
        let Some(topic) = topics.get_mut(&self.endpoint) else {
            return Ok(());
        };

        match mode {
            AckMode::Individual => {
                for offset in offsets.iter().rev() {
                    if let (Some(p), Some(pos)) =
                        (Inner::partition_of(&self.endpoint, offset), offset.as_position())
                    {
                        topic.group.requeue.push_front((p, pos));
                    }
                }
            }
            AckMode::Cumulative => {
                for offset in offsets {
                    if let (Some(p), Some(pos)) =
                        (Inner::partition_of(&self.endpoint, offset), offset.as_position())
                    {
                        let floor = topic.group.committed[p].map(|c| c + 1).unwrap_or(0);
                        let cursor = &mut topic.group.cursors[p];
                        *cursor = (*cursor).min(pos).max(floor);
                    }
                }
            }
        }
        topic.notify.notify_one();
        debug!(endpoint = %self.endpoint, count = offsets.len(), "Rolled back offsets");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut topics = self.inner.topics.lock().await;
        if let Some(topic) = topics.get_mut(&self.endpoint) {
            topic.group.closed = true;
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
