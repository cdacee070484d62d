use crate::aggregation::AggregationError;
use crate::event::{Event, Sequence, Version};
use crate::inline::InlineProjections;
use crate::message::OutgoingMessage;
use crate::persist::{PersistenceError, Result};
use crate::storage::{
    BatchFactory, DeadLetterEvent, DocumentKey, DocumentLoader, DocumentOperation, EventFilter, EventLoader,
    HighWaterDetector, HighWaterStatistics, ProgressStore, ProjectionBatch, ShardProgress, StoredDocument,
};
use crate::stream::{StreamAction, StreamIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct State {
    events: Vec<Event>,
    streams: HashMap<(String, StreamIdentity), Version>,
    documents: HashMap<DocumentKey, StoredDocument>,
    progress: HashMap<String, Sequence>,
    dead_letters: Vec<DeadLetterEvent>,
    published: Vec<OutgoingMessage>,
}

impl State {
    fn next_sequence(&self) -> Sequence {
        self.events.last().map_or(1, |e| e.sequence() + 1)
    }

    /// Turns actions into events without recording them.
    fn stage(&self, actions: Vec<StreamAction>) -> Result<(Vec<Event>, Vec<((String, StreamIdentity), Version)>)> {
        let mut next = self.next_sequence();
        let mut versions: HashMap<(String, StreamIdentity), Version> = HashMap::new();
        let mut staged = Vec::new();
        let now = Utc::now();
        for action in actions {
            let key = (action.tenant_id().to_string(), action.stream().clone());
            let current = versions.get(&key).or_else(|| self.streams.get(&key)).copied();
            let events = action
                .into_events(current, &mut next, now)
                .map_err(|err| PersistenceError::Conflict(err.to_string()))?;
            if let Some(last) = events.last() {
                versions.insert(key, last.version());
            }
            staged.extend(events);
        }
        Ok((staged, versions.into_iter().collect()))
    }

    fn commit(&mut self, events: Vec<Event>, versions: Vec<((String, StreamIdentity), Version)>) {
        self.streams.extend(versions);
        self.events.extend(events);
    }
}

/// Event log, document store and progress table in memory, for tests and embedding.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    failing_loads: Arc<AtomicUsize>,
    commit_delay_ms: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every action or none of them.
    pub async fn append(&self, actions: impl IntoIterator<Item = StreamAction>) -> Result<Vec<Event>> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.write();
        let (events, versions) = state.stage(actions.into_iter().collect())?;
        state.commit(events.clone(), versions);
        debug!(appended = events.len(), "appended events");
        Ok(events)
    }

    /// Appends events and applies `inline` projections to them in the same write.
    pub async fn append_with_inline(
        &self,
        actions: impl IntoIterator<Item = StreamAction>,
        inline: &InlineProjections,
    ) -> std::result::Result<Vec<Event>, AggregationError> {
        let _writer = self.writer.lock().await;
        let (events, versions) = self.state.read().stage(actions.into_iter().collect())?;
        let mut batch = MemoryBatch::new(self.clone());
        inline.apply(&events, &mut batch, Arc::new(self.clone())).await?;
        self.state.write().commit(events.clone(), versions);
        batch.commit()?;
        Ok(events)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.read().events.clone()
    }

    pub fn stream_version(&self, tenant_id: &str, stream: &StreamIdentity) -> Option<Version> {
        self.state
            .read()
            .streams
            .get(&(tenant_id.to_string(), stream.clone()))
            .copied()
    }

    pub fn document(&self, doc_type: &str, tenant_id: &str, id: &str) -> Option<StoredDocument> {
        let key = DocumentKey {
            doc_type: doc_type.to_string(),
            tenant_id: tenant_id.to_string(),
            id: id.to_string(),
        };
        self.state.read().documents.get(&key).cloned()
    }

    pub fn documents_of(&self, doc_type: &str) -> Vec<StoredDocument> {
        let mut documents: Vec<StoredDocument> = self
            .state
            .read()
            .documents
            .values()
            .filter(|d| d.doc_type == doc_type)
            .cloned()
            .collect();
        documents.sort_by(|a, b| (&a.tenant_id, &a.id).cmp(&(&b.tenant_id, &b.id)));
        documents
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEvent> {
        self.state.read().dead_letters.clone()
    }

    pub fn dead_letters_for(&self, shard: &str) -> Vec<DeadLetterEvent> {
        self.state
            .read()
            .dead_letters
            .iter()
            .filter(|d| d.shard == shard)
            .cloned()
            .collect()
    }

    /// Names of the messages published by committed batches, in order.
    pub fn published(&self) -> Vec<&'static str> {
        self.state.read().published.iter().map(|m| m.message.name()).collect()
    }

    pub fn take_published(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.state.write().published)
    }

    /// Makes the next `count` event loads fail with a connection error.
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Makes every projection batch wait `delay` before it commits.
    pub fn delay_commits(&self, delay: Duration) {
        self.commit_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn commit_delay(&self) -> Duration {
        Duration::from_millis(self.commit_delay_ms.load(Ordering::SeqCst))
    }

    fn take_load_failure(&self) -> bool {
        self.failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("events", &state.events.len())
            .field("documents", &state.documents.len())
            .field("progress", &state.progress)
            .field("dead_letters", &state.dead_letters.len())
            .finish()
    }
}

#[async_trait]
impl EventLoader for MemoryStore {
    async fn load_events(&self, filter: &EventFilter, floor: Sequence, ceiling: Sequence) -> Result<Vec<Event>> {
        if self.take_load_failure() {
            return Err(PersistenceError::ConnectionError("injected load failure".into()));
        }
        Ok(self
            .state
            .read()
            .events
            .iter()
            .filter(|e| e.sequence() > floor && e.sequence() <= ceiling && filter.matches(e))
            .cloned()
            .collect())
    }

    async fn find_sequence_at(&self, timestamp: DateTime<Utc>) -> Result<Sequence> {
        Ok(self
            .state
            .read()
            .events
            .iter()
            .take_while(|e| e.timestamp() <= timestamp)
            .last()
            .map_or(0, Event::sequence))
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn fetch_progress(&self, shard: &str) -> Result<Option<Sequence>> {
        Ok(self.state.read().progress.get(shard).copied())
    }

    async fn fetch_all_progress(&self) -> Result<Vec<ShardProgress>> {
        let mut all: Vec<ShardProgress> = self
            .state
            .read()
            .progress
            .iter()
            .map(|(shard, sequence)| ShardProgress {
                shard: shard.clone(),
                sequence: *sequence,
            })
            .collect();
        all.sort_by(|a, b| a.shard.cmp(&b.shard));
        Ok(all)
    }

    async fn set_progress(&self, shard: &str, sequence: Sequence) -> Result<()> {
        self.state.write().progress.insert(shard.to_string(), sequence);
        Ok(())
    }

    async fn delete_progress(&self, shard: &str) -> Result<()> {
        self.state.write().progress.remove(shard);
        Ok(())
    }
}

#[async_trait]
impl DocumentLoader for MemoryStore {
    async fn load_documents(&self, doc_type: &str, tenant_id: &str, ids: &[String]) -> Result<Vec<StoredDocument>> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .documents
                    .get(&DocumentKey {
                        doc_type: doc_type.to_string(),
                        tenant_id: tenant_id.to_string(),
                        id: id.clone(),
                    })
                    .cloned()
            })
            .collect())
    }
}

#[async_trait]
impl HighWaterDetector for MemoryStore {
    async fn detect(&self) -> Result<HighWaterStatistics> {
        let highest = self.state.read().events.last().map_or(0, Event::sequence);
        Ok(HighWaterStatistics {
            high_water_mark: highest,
            highest_sequence: highest,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl BatchFactory for MemoryStore {
    async fn start_batch(&self) -> Result<Box<dyn ProjectionBatch>> {
        Ok(Box::new(MemoryBatch::new(self.clone())))
    }

    async fn teardown_documents(&self, doc_type: &str) -> Result<()> {
        self.state.write().documents.retain(|key, _| key.doc_type != doc_type);
        Ok(())
    }
}

/// Writes queued against a [`MemoryStore`], applied together on execute.
pub struct MemoryBatch {
    store: MemoryStore,
    operations: Vec<DocumentOperation>,
    progress: Vec<(String, Sequence, Sequence)>,
    actions: Vec<StreamAction>,
    messages: Vec<OutgoingMessage>,
    dead_letters: Vec<DeadLetterEvent>,
}

impl MemoryBatch {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            operations: Vec::new(),
            progress: Vec::new(),
            actions: Vec::new(),
            messages: Vec::new(),
            dead_letters: Vec::new(),
        }
    }

    /// Applies every write, or none when a progress check or stream append fails.
    /// The caller must hold the store's writer lock.
    fn commit(self) -> Result<()> {
        let mut state = self.store.state.write();
        for (shard, floor, _) in &self.progress {
            let stored = state.progress.get(shard).copied();
            if stored.unwrap_or(0) != *floor {
                return Err(PersistenceError::ProgressOutOfOrder {
                    shard: shard.clone(),
                    expected: *floor,
                    actual: stored,
                });
            }
        }
        let (events, versions) = state.stage(self.actions)?;
        state.commit(events, versions);

        let now = Utc::now();
        for operation in self.operations {
            match operation {
                DocumentOperation::Upsert(document) => {
                    state.documents.insert(document.key(), document);
                }
                DocumentOperation::SoftDelete(key) => {
                    if let Some(document) = state.documents.get_mut(&key) {
                        document.deleted = true;
                        document.last_modified = now;
                    }
                }
                DocumentOperation::Remove(key) => {
                    state.documents.remove(&key);
                }
            }
        }
        for (shard, _, ceiling) in self.progress {
            state.progress.insert(shard, ceiling);
        }
        state.dead_letters.extend(self.dead_letters);
        state.published.extend(self.messages);
        Ok(())
    }
}

#[async_trait]
impl ProjectionBatch for MemoryBatch {
    fn queue(&mut self, operation: DocumentOperation) {
        self.operations.push(operation);
    }

    fn mark_progress(&mut self, shard: &str, floor: Sequence, ceiling: Sequence) {
        self.progress.push((shard.to_string(), floor, ceiling));
    }

    fn append_events(&mut self, action: StreamAction) {
        self.actions.push(action);
    }

    fn publish(&mut self, message: OutgoingMessage) {
        self.messages.push(message);
    }

    fn dead_letter(&mut self, event: DeadLetterEvent) {
        self.dead_letters.push(event);
    }

    fn operation_count(&self) -> usize {
        self.operations.len()
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        let delay = self.store.commit_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let writer = self.store.writer.clone();
        let _writer = writer.lock().await;
        (*self).commit()
    }
}
