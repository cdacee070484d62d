//! Contracts with the event log and document store the projection core runs against.

use crate::event::{Event, Sequence, Version};
use crate::message::OutgoingMessage;
use crate::persist::Result;
use crate::stream::StreamAction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;
use ulid::Ulid;

/// Selects the events a shard reads from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    types: Option<HashSet<TypeId>>,
    tenant_id: Option<String>,
    include_archived: bool,
}

impl EventFilter {
    /// Every event in the log.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_types(types: impl IntoIterator<Item = TypeId>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.types.is_none() && self.tenant_id.is_none()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if event.is_archived() && !self.include_archived {
            return false;
        }
        if let Some(tenant) = &self.tenant_id {
            if event.tenant_id() != tenant {
                return false;
            }
        }
        match &self.types {
            Some(types) => types.contains(&event.event_type().id()),
            None => true,
        }
    }
}

/// A persisted snapshot, already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub doc_type: String,
    pub tenant_id: String,
    pub id: String,
    pub payload: Vec<u8>,
    pub version: Version,
    pub deleted: bool,
    pub last_modified: DateTime<Utc>,
}

impl StoredDocument {
    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            doc_type: self.doc_type.clone(),
            tenant_id: self.tenant_id.clone(),
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub doc_type: String,
    pub tenant_id: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOperation {
    /// Insert or replace; clears any soft-deleted mark.
    Upsert(StoredDocument),
    SoftDelete(DocumentKey),
    Remove(DocumentKey),
}

/// A permanently failed event, recorded once and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEvent {
    pub projection: String,
    pub shard: String,
    pub event_id: Ulid,
    pub event_sequence: Sequence,
    pub event_type: String,
    pub tenant_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(projection: &str, shard: &str, event: &Event, error: impl ToString) -> Self {
        Self {
            projection: projection.to_string(),
            shard: shard.to_string(),
            event_id: event.id(),
            event_sequence: event.sequence(),
            event_type: event.event_type().name().to_string(),
            tenant_id: event.tenant_id().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardProgress {
    pub shard: String,
    pub sequence: Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighWaterStatistics {
    /// Highest sequence below which the log has no gaps.
    pub high_water_mark: Sequence,
    /// Highest sequence written, possibly past a gap.
    pub highest_sequence: Sequence,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait EventLoader: Send + Sync + 'static {
    /// Events matching `filter` with `floor < sequence <= ceiling`, ascending.
    async fn load_events(&self, filter: &EventFilter, floor: Sequence, ceiling: Sequence) -> Result<Vec<Event>>;

    /// Highest sequence recorded at or before `timestamp`; 0 when none.
    async fn find_sequence_at(&self, timestamp: DateTime<Utc>) -> Result<Sequence>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync + 'static {
    async fn fetch_progress(&self, shard: &str) -> Result<Option<Sequence>>;

    async fn fetch_all_progress(&self) -> Result<Vec<ShardProgress>>;

    /// Overwrites the stored position, used by rewinds.
    async fn set_progress(&self, shard: &str, sequence: Sequence) -> Result<()>;

    async fn delete_progress(&self, shard: &str) -> Result<()>;
}

/// Bulk read access to stored documents, also handed to handlers as their session.
#[async_trait]
pub trait DocumentLoader: Send + Sync + 'static {
    async fn load_documents(&self, doc_type: &str, tenant_id: &str, ids: &[String]) -> Result<Vec<StoredDocument>>;
}

#[async_trait]
pub trait HighWaterDetector: Send + Sync + 'static {
    async fn detect(&self) -> Result<HighWaterStatistics>;
}

/// A unit of work applied atomically by [`ProjectionBatch::execute`].
///
/// Dropping a batch without executing it discards every queued write.
#[async_trait]
pub trait ProjectionBatch: Send {
    fn queue(&mut self, operation: DocumentOperation);

    /// Moves the stored progress of `shard` from `floor` to `ceiling`.
    ///
    /// Execution fails with [`PersistenceError::ProgressOutOfOrder`](crate::persist::PersistenceError)
    /// when the stored progress is not `floor` at that point.
    fn mark_progress(&mut self, shard: &str, floor: Sequence, ceiling: Sequence);

    fn append_events(&mut self, action: StreamAction);

    fn publish(&mut self, message: OutgoingMessage);

    fn dead_letter(&mut self, event: DeadLetterEvent);

    fn operation_count(&self) -> usize;

    async fn execute(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait BatchFactory: Send + Sync + 'static {
    async fn start_batch(&self) -> Result<Box<dyn ProjectionBatch>>;

    /// Removes every stored document of `doc_type` ahead of a rebuild.
    async fn teardown_documents(&self, doc_type: &str) -> Result<()>;
}

/// A document loader with nothing in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDocuments;

#[async_trait]
impl DocumentLoader for NoDocuments {
    async fn load_documents(&self, _doc_type: &str, _tenant_id: &str, _ids: &[String]) -> Result<Vec<StoredDocument>> {
        Ok(Vec::new())
    }
}

/// Every collaborator the daemon needs, usually all backed by one store.
#[derive(Clone)]
pub struct DaemonStorage {
    pub events: Arc<dyn EventLoader>,
    pub progress: Arc<dyn ProgressStore>,
    pub batches: Arc<dyn BatchFactory>,
    pub documents: Arc<dyn DocumentLoader>,
    pub high_water: Arc<dyn HighWaterDetector>,
}

impl DaemonStorage {
    pub fn from_store<S>(store: S) -> Self
    where
        S: EventLoader + ProgressStore + BatchFactory + DocumentLoader + HighWaterDetector,
    {
        let store = Arc::new(store);
        Self {
            events: store.clone(),
            progress: store.clone(),
            batches: store.clone(),
            documents: store.clone(),
            high_water: store,
        }
    }
}

impl std::fmt::Debug for DaemonStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Rented;

    #[derive(Debug)]
    struct Returned;

    #[test]
    fn test_filter_by_type() {
        let filter = EventFilter::of_types([TypeId::of::<Rented>()]);
        assert!(filter.matches(&Event::builder(Rented).build()));
        assert!(!filter.matches(&Event::builder(Returned).build()));
        assert!(!filter.is_unrestricted());
    }

    #[test]
    fn test_filter_by_tenant() {
        let filter = EventFilter::all().for_tenant("blue");
        assert!(filter.matches(&Event::builder(Rented).tenant("blue").build()));
        assert!(!filter.matches(&Event::builder(Rented).tenant("red").build()));
    }

    #[test]
    fn test_archived_events_are_excluded_unless_requested() {
        let archived = Event::builder(Rented).archived(true).build();
        assert!(!EventFilter::all().matches(&archived));
        assert!(EventFilter::all().include_archived(true).matches(&archived));
    }

    #[test]
    fn test_dead_letter_captures_the_event() {
        let event = Event::builder(Returned).sequence(12).tenant("blue").build();
        let letter = DeadLetterEvent::new("Rentals", "Rentals:All", &event, "boom");

        assert_eq!(letter.event_sequence, 12);
        assert_eq!(letter.event_id, event.id());
        assert_eq!(letter.tenant_id, "blue");
        assert_eq!(letter.error, "boom");
        assert!(letter.event_type.ends_with("Returned"));
    }

    #[tokio::test]
    async fn test_no_documents_loads_nothing() {
        let loaded = NoDocuments.load_documents("Trip", "*DEFAULT*", &["a".to_string()]).await.unwrap();
        assert!(loaded.is_empty());
    }
}
